//!
//! Object access within one object set: dnodes by id, logical blocks through the indirect
//! tree, and ZAP lookups
//!
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use nom::{number::complete as number, IResult};
use tracing::{debug, trace};

use crate::device::BlockReader;
use crate::dmu::{DNodePhys, DNODE_SIZE};
use crate::session::{Objset, Scope};
use crate::spa::{BlockPtr, BLKPTR_SIZE};
use crate::zap::{
    zap_hash_idx, MZapPhys, ZapBlock, ZapEntry, ZapKey, ZapLeafPhys, ZapPhys,
};
use crate::{invalid, not_found, ZfsError};

/// Indirect blocks kept per store before the cache is dropped
const INDIRECT_CACHE_MAX: usize = 64;

/// Byte offset of `extra_slots` within a dnode header
const DNODE_EXTRA_SLOTS_OFFSET: usize = 12;

/// Where a logical block id lands in a dnode's block tree
#[derive(Debug, Clone)]
pub enum Located {
    Ptr(BlockPtr),
    /// A hole at `level`, covering `span` level-0 blocks starting at the aligned block id
    Hole { level: u8, span: u64 },
}

/// The direct pointers of one object plus its optional spill pointer
#[derive(Debug, Clone)]
pub struct BlockPointers {
    pub nblkptr: usize,
    pub direct: Vec<BlockPtr>,
    pub spill: Option<BlockPtr>,
}

#[derive(Debug, Clone)]
pub enum Zap {
    Micro(MZapPhys),
    Fat(ZapPhys),
}

impl Zap {
    pub fn is_micro(&self) -> bool {
        matches!(self, Zap::Micro(_))
    }
}

pub struct ObjectStore<'a> {
    reader: &'a dyn BlockReader,
    objset: Objset,
    indirect_cache: RefCell<HashMap<(u64, u64, u64), Rc<Vec<u8>>>>,
}

impl<'a> ObjectStore<'a> {
    pub fn new(reader: &'a dyn BlockReader, objset: Objset) -> Self {
        Self {
            reader,
            objset,
            indirect_cache: RefCell::new(HashMap::new()),
        }
    }
    pub fn objset(&self) -> &Objset {
        &self.objset
    }
    pub fn scope(&self) -> Scope {
        self.objset.scope
    }
    pub fn reader(&self) -> &'a dyn BlockReader {
        self.reader
    }
    fn metadnode(&self) -> &DNodePhys {
        &self.objset.phys.metadnode
    }

    /// Resolve an indirect block, reusing copies read earlier in this request
    pub(crate) fn read_indirect(&self, bp: &BlockPtr) -> Result<Rc<Vec<u8>>, ZfsError> {
        let key = bp
            .dvas()
            .next()
            .map(|d| (d.vdev as u64, d.offset, bp.birth_txg()));
        if let Some(key) = key {
            if let Some(hit) = self.indirect_cache.borrow().get(&key) {
                return Ok(Rc::clone(hit));
            }
        }
        let data = Rc::new(self.reader.resolve(bp)?);
        if let Some(key) = key {
            let mut cache = self.indirect_cache.borrow_mut();
            if cache.len() >= INDIRECT_CACHE_MAX {
                cache.clear();
            }
            cache.insert(key, Rc::clone(&data));
        }
        Ok(data)
    }

    /// Find the level-0 pointer for `block_id`, or the hole that covers it
    pub fn locate(&self, dnode: &DNodePhys, block_id: u64) -> Result<Located, ZfsError> {
        if block_id > dnode.header.max_block_id {
            return not_found(format!(
                "block {} beyond max block id {}",
                block_id, dnode.header.max_block_id
            ));
        }
        let levels = dnode.header.levels;
        if levels == 0 || dnode.block_pointers.is_empty() {
            return invalid("dnode has no block pointers");
        }
        let shift = dnode
            .header
            .indirect_block_shift
            .saturating_sub(crate::dmu::SPA_BLKPTRSHIFT) as u64;
        if shift == 0 && levels > 1 {
            return invalid("indirect block shift too small");
        }
        if dnode.header.indirect_block_shift > crate::dmu::DN_MAX_INDBLKSHIFT {
            return invalid(format!(
                "indirect block shift {} past the maximum {}",
                dnode.header.indirect_block_shift,
                crate::dmu::DN_MAX_INDBLKSHIFT
            ));
        }
        let mut level = levels - 1;
        let top = level_index(block_id, level, shift, u64::MAX);
        let mut bp = match dnode.block_pointers.get(top as usize) {
            Some(bp) => bp.clone(),
            None => return not_found(format!("block {} beyond top-level pointers", block_id)),
        };
        loop {
            if bp.is_hole() {
                return Ok(Located::Hole {
                    level,
                    span: span_of(level, shift),
                });
            }
            if level == 0 {
                return Ok(Located::Ptr(bp));
            }
            if bp.is_embedded() {
                return invalid("embedded block pointer above level 0");
            }
            let block = self.read_indirect(&bp)?;
            level -= 1;
            let idx = level_index(block_id, level, shift, 1 << shift) as usize;
            let start = idx * BLKPTR_SIZE;
            if start + BLKPTR_SIZE > block.len() {
                return invalid("indirect block shorter than its pointer count");
            }
            bp = BlockPtr::parse(&block[start..])?.1;
        }
    }

    /// The logical contents of one data block; holes read as zeroes
    pub fn read_block(&self, dnode: &DNodePhys, block_id: u64) -> Result<Vec<u8>, ZfsError> {
        match self.locate(dnode, block_id)? {
            Located::Ptr(bp) => self.reader.resolve(&bp),
            Located::Hole { .. } => Ok(vec![0; dnode.data_block_size() as usize]),
        }
    }

    /// Decode the dnode for object `id`. Free slots and the interior of large dnodes are not
    /// objects.
    pub fn get_dnode(&self, id: u64) -> Result<DNodePhys, ZfsError> {
        let meta = self.metadnode();
        let per_block = self.objset.phys.dnodes_per_block();
        let block_id = id / per_block;
        let slot = (id % per_block) as usize;
        if block_id > meta.header.max_block_id {
            return not_found(format!("object {} not allocated", id));
        }
        let block = match self.locate(meta, block_id)? {
            Located::Ptr(bp) => self.reader.resolve(&bp)?,
            Located::Hole { .. } => return not_found(format!("object {} not allocated", id)),
        };
        if !slot_starts_dnode(&block, slot) {
            return not_found(format!("object {} not allocated", id));
        }
        let (_, dn) = DNodePhys::parse(&block[slot * DNODE_SIZE..])?;
        trace!(id, kind = dn.kind(), "dnode read");
        Ok(dn)
    }

    pub fn get_object(&self, id: u64) -> Result<DNodePhys, ZfsError> {
        self.get_dnode(id)
    }

    pub fn get_block_pointers(&self, id: u64) -> Result<BlockPointers, ZfsError> {
        let dn = self.get_dnode(id)?;
        Ok(BlockPointers {
            nblkptr: dn.header.num_block_ptr as usize,
            direct: dn.block_pointers,
            spill: dn.spill,
        })
    }

    /// Allocated objects with ids strictly greater than `after`, in id order
    pub fn list_objects(&self, after: u64) -> ObjectWalk<'_, 'a> {
        ObjectWalk {
            store: self,
            next_id: after.saturating_add(1),
            block: None,
            done: after == u64::MAX,
        }
    }

    /// Best-effort check that `id` names an allocated object. A false positive is possible
    /// when a plain integer happens to match an object id.
    pub fn probe_reference(&self, id: u64) -> bool {
        if id == 0 {
            return false;
        }
        match self.get_dnode(id) {
            Ok(_) => true,
            Err(e) => {
                trace!(id, error = %e, "reference probe failed");
                false
            }
        }
    }

    /// Logical bytes `[offset, offset + len)` of an object, clipped at its last block
    pub fn read_object_data(
        &self,
        dnode: &DNodePhys,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, ZfsError> {
        let end = offset.saturating_add(len).min(dnode.max_offset());
        if offset >= end {
            return Ok(Vec::new());
        }
        let bs = dnode.data_block_size();
        if bs == 0 {
            return invalid("zero data block size");
        }
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let block_id = pos / bs;
            let within = (pos % bs) as usize;
            let block = self.read_block(dnode, block_id)?;
            let take = ((end - pos) as usize).min(block.len().saturating_sub(within));
            if take == 0 {
                return invalid(format!("block {} shorter than the block size", block_id));
            }
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    pub fn read_zap(&self, dnode: &DNodePhys) -> Result<Zap, ZfsError> {
        let block_size = dnode.data_block_size() as usize;
        let block = self.read_block(dnode, 0)?;
        match ZapBlock::parse(&block, block_size)?.1 {
            ZapBlock::MicroZap(m) => Ok(Zap::Micro(m)),
            ZapBlock::FatHeader(f) => Ok(Zap::Fat(f)),
            ZapBlock::FatLeaf(_) => invalid("ZAP block 0 is a leaf"),
        }
    }

    pub fn zap_leaf(&self, dnode: &DNodePhys, block_id: u64) -> Result<ZapLeafPhys, ZfsError> {
        let block = self.read_block(dnode, block_id)?;
        Ok(ZapLeafPhys::parse(&block, dnode.data_block_size() as usize)?.1)
    }

    /// Every distinct leaf block the pointer table references, in block order
    pub fn zap_leaf_blocks(&self, dnode: &DNodePhys, zap: &ZapPhys) -> Result<Vec<u64>, ZfsError> {
        let mut blocks: Vec<u64> = if zap.embedded_ptrtbl() {
            zap.leafs.iter().copied().filter(|b| *b != 0).collect()
        } else {
            let mut out = vec![];
            for i in 0..zap.ptrtbl.numblks {
                let block = self.read_block(dnode, zap.ptrtbl.blk + i)?;
                let nums = le_words(&block)?.1;
                out.extend(nums.into_iter().filter(|p| *p != 0));
            }
            out
        };
        blocks.sort_unstable();
        blocks.dedup();
        Ok(blocks)
    }

    /// Leaf block holding entries whose hash is `hash`
    fn zap_leaf_for(&self, dnode: &DNodePhys, zap: &ZapPhys, hash: u64) -> Result<u64, ZfsError> {
        let idx = zap_hash_idx(hash, zap.ptrtbl.shift);
        if zap.embedded_ptrtbl() {
            return match zap.leafs.get(idx as usize) {
                Some(b) => Ok(*b),
                None => invalid("pointer table index outside the embedded table"),
            };
        }
        let per_block = (dnode.data_block_size() / 8).max(1);
        let block_idx = idx / per_block;
        if block_idx >= zap.ptrtbl.numblks {
            return invalid("pointer table index outside the table");
        }
        let tbl = self.read_block(dnode, zap.ptrtbl.blk + block_idx)?;
        let at = (idx % per_block) as usize * 8;
        match tbl.get(at..at + 8) {
            Some(word) => Ok(number::le_u64(word)?.1),
            None => invalid(format!(
                "pointer table block {} is {} bytes, entry at {}",
                zap.ptrtbl.blk + block_idx,
                tbl.len(),
                at
            )),
        }
    }

    fn fat_lookup(
        &self,
        dnode: &DNodePhys,
        zap: &ZapPhys,
        key: ZapKey,
        hash: u64,
    ) -> Result<Option<ZapEntry>, ZfsError> {
        let leaf_block = self.zap_leaf_for(dnode, zap, hash)?;
        if leaf_block == 0 {
            return Ok(None);
        }
        Ok(self.zap_leaf(dnode, leaf_block)?.lookup(&key, hash))
    }

    /// Entries in ZAP object `obj`, from its header alone
    pub fn zap_count(&self, obj: u64) -> Result<u64, ZfsError> {
        let dn = self.get_object(obj)?;
        Ok(match self.read_zap(&dn)? {
            Zap::Micro(m) => m.num_entries(),
            Zap::Fat(f) => f.num_entries,
        })
    }

    /// Look up a string key
    pub fn zap_lookup(&self, dnode: &DNodePhys, name: &str) -> Result<Option<ZapEntry>, ZfsError> {
        match self.read_zap(dnode)? {
            Zap::Micro(m) => Ok(m.live_entries().find_map(|(chunk, e)| {
                if e.name_bytes() == name.as_bytes() {
                    m.entry(chunk)
                } else {
                    None
                }
            })),
            Zap::Fat(f) => {
                if f.uint64_keys() {
                    return Ok(None);
                }
                let hash = f.hash_str(name.as_bytes());
                self.fat_lookup(dnode, &f, ZapKey::Str(name.as_bytes().to_vec()), hash)
            }
        }
    }

    /// Look up a single integer key in a map keyed by integers
    pub fn zap_lookup_int(&self, dnode: &DNodePhys, key: u64) -> Result<Option<ZapEntry>, ZfsError> {
        match self.read_zap(dnode)? {
            Zap::Micro(_) => Ok(None),
            Zap::Fat(f) => {
                if !f.uint64_keys() {
                    return Ok(None);
                }
                let hash = f.hash_ints(&[key]);
                self.fat_lookup(dnode, &f, ZapKey::Ints(vec![key]), hash)
            }
        }
    }

    /// Look up `name` and require a single 8-byte integer value
    pub fn zap_lookup_u64(&self, dnode: &DNodePhys, name: &str) -> Result<Option<u64>, ZfsError> {
        match self.zap_lookup(dnode, name)? {
            Some(entry) => match entry.single_u64() {
                Some(v) => Ok(Some(v)),
                None => invalid(format!("ZAP entry {:?} is not a single integer", name)),
            },
            None => Ok(None),
        }
    }
}

/// Little-endian 64-bit words; a trailing partial word is ignored
pub(crate) fn le_words(input: &[u8]) -> IResult<&[u8], Vec<u64>> {
    nom::multi::many0(number::le_u64)(input)
}

/// Index into the pointer array at `level` for `block_id`, bounded by `fanout`
fn level_index(block_id: u64, level: u8, shift: u64, fanout: u64) -> u64 {
    let bits = level as u64 * shift;
    let idx = if bits >= 64 { 0 } else { block_id >> bits };
    if fanout == u64::MAX {
        idx
    } else {
        idx % fanout
    }
}

fn span_of(level: u8, shift: u64) -> u64 {
    let bits = level as u64 * shift;
    if bits >= 64 {
        u64::MAX
    } else {
        1 << bits
    }
}

/// Walk the block's slots from the start, stepping over large dnodes, to see whether `slot`
/// begins an allocated dnode
fn slot_starts_dnode(block: &[u8], slot: usize) -> bool {
    let slots = block.len() / DNODE_SIZE;
    let mut i = 0;
    while i < slot && i < slots {
        let base = i * DNODE_SIZE;
        if block[base] == 0 {
            i += 1;
        } else {
            i += block[base + DNODE_EXTRA_SLOTS_OFFSET] as usize + 1;
        }
    }
    i == slot && slot < slots && block[slot * DNODE_SIZE] != 0
}

/// Iterator over allocated objects; see [`ObjectStore::list_objects`]
pub struct ObjectWalk<'s, 'a> {
    store: &'s ObjectStore<'a>,
    next_id: u64,
    block: Option<(u64, Vec<u8>)>,
    done: bool,
}

impl<'s, 'a> ObjectWalk<'s, 'a> {
    /// The id the next call to `next` starts scanning from
    pub fn position(&self) -> u64 {
        self.next_id
    }
}

impl<'s, 'a> Iterator for ObjectWalk<'s, 'a> {
    type Item = Result<(u64, DNodePhys), ZfsError>;

    fn next(&mut self) -> Option<Self::Item> {
        let meta = self.store.metadnode();
        let per_block = self.store.objset.phys.dnodes_per_block();
        while !self.done {
            let id = self.next_id;
            let block_id = id / per_block;
            if block_id > meta.header.max_block_id {
                self.done = true;
                break;
            }
            if self.block.as_ref().map(|(b, _)| *b) != Some(block_id) {
                match self.store.locate(meta, block_id) {
                    Ok(Located::Ptr(bp)) => match self.store.reader.resolve(&bp) {
                        Ok(data) => self.block = Some((block_id, data)),
                        Err(e) => {
                            self.skip_to_block(block_id.saturating_add(1), per_block);
                            return Some(Err(e));
                        }
                    },
                    Ok(Located::Hole { span, .. }) => {
                        // skip everything the hole covers
                        let aligned = block_id - block_id % span.max(1);
                        self.skip_to_block(aligned.saturating_add(span), per_block);
                        continue;
                    }
                    Err(e) => {
                        self.skip_to_block(block_id.saturating_add(1), per_block);
                        return Some(Err(e));
                    }
                }
            }
            let block = match &self.block {
                Some((_, data)) => data,
                None => continue,
            };
            let slot = (id % per_block) as usize;
            let base = slot * DNODE_SIZE;
            if base >= block.len() || block[base] == 0 {
                self.next_id = id.saturating_add(1);
                if self.next_id == 0 {
                    self.done = true;
                }
                continue;
            }
            return match DNodePhys::parse(&block[base..]) {
                Ok((_, dn)) => {
                    self.next_id = id.saturating_add(dn.header.extra_slots as u64 + 1);
                    Some(Ok((id, dn)))
                }
                Err(e) => {
                    debug!(id, "undecodable dnode");
                    self.next_id = id.saturating_add(1);
                    Some(Err(e.into()))
                }
            };
        }
        None
    }
}

impl<'s, 'a> ObjectWalk<'s, 'a> {
    fn skip_to_block(&mut self, block_id: u64, per_block: u64) {
        match block_id.checked_mul(per_block) {
            Some(id) => self.next_id = id,
            None => self.done = true,
        }
    }
}

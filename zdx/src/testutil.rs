//!
//! Synthetic pools for tests: encoders for every on-disk record the decoders read, an
//! in-memory device, and a builder that lays out a MOS and filesystem objsets on it
//!
use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};

use crate::catalog::{
    DMU_OT_DIRECTORY_CONTENTS, DMU_OT_DSL_DATASET, DMU_OT_DSL_DIR, DMU_OT_DSL_DIR_CHILD_MAP,
    DMU_OT_DSL_DS_SNAP_MAP, DMU_OT_MASTER_NODE, DMU_OT_OBJECT_DIRECTORY,
    DMU_OT_PLAIN_FILE_CONTENTS, DMU_OT_SA, DMU_OT_SPACE_MAP, DMU_OT_SPACE_MAP_HEADER, DMU_OT_ZNODE,
};
use crate::device::{RawDevice, VdevSet};
use crate::dmu::{DNODE_FLAG_SPILL_BLKPTR, DNODE_SIZE};
use crate::fletcher::Fletcher4;
use crate::nvlist::NvList;
use crate::session::PoolSession;
use crate::spa::{BlockPtr, Uberblock, LABEL_SIZE, UBERBLOCK_MAGIC, VDEV_DATA_OFFSET};
use crate::spacemap::SmOp;
use crate::zap::{
    zap_hash, zap_hash_u64, zap_leaf_numchunks, ZapKey, ZAP_CHAIN_END, ZAP_FLAG_HASH64,
    ZAP_MAGIC, ZBT_HEADER, ZBT_LEAF, ZBT_MICRO,
};
use crate::zpl::{DirEntry, SAAttrPhys, SAByteswapType, SA_MAGIC};
use crate::ZfsError;

const DMU_OT_DNODE: u8 = 10;
const DMU_OT_OBJSET: u8 = 11;
const DMU_OT_ZFS_DELETE_QUEUE: u8 = 22;
const DMU_OT_SA_MASTER_NODE: u8 = 45;
const DMU_OT_SA_ATTR_REGISTRATION: u8 = 46;
const DMU_OT_SA_ATTR_LAYOUTS: u8 = 47;

const CHECKSUM_FLETCHER4: u8 = 7;
const COMPRESS_OFF: u8 = 2;

const ZAP_BLOCK_SIZE: usize = 4096;
const MZAP_CHUNKS: usize = ZAP_BLOCK_SIZE / 64 - 1;
/// Fixture leaves split well before they fill so that small maps still span leaves
const FIXTURE_LEAF_ENTRIES: usize = 16;
const ZAP_LEAF_MAGIC: u32 = 0x2AB1_EAF;
const ZEC_MAGIC: u64 = 0x210d_a7ab_10c7_a11;

/// 16 KiB meta dnode blocks hold 32 dnodes
const META_BLOCK_SIZE: u64 = 16 * 1024;
const DNODES_PER_BLOCK: u64 = META_BLOCK_SIZE / DNODE_SIZE as u64;
const DEFAULT_INDIRECT_SHIFT: u8 = 14;

/// Layout number used for every SA znode the builder writes
pub const FIXTURE_SA_LAYOUT: u16 = 2;
/// Attribute numbers of the fixture layout, in packing order
const FIXTURE_SA_ATTRS: [u16; 12] = [5, 6, 4, 12, 13, 7, 11, 0, 1, 2, 3, 8];
const FIXTURE_SA_REGISTRY: [(&str, u16, u16); 12] = [
    ("ZPL_MODE", 5, 8),
    ("ZPL_SIZE", 6, 8),
    ("ZPL_GEN", 4, 8),
    ("ZPL_UID", 12, 8),
    ("ZPL_GID", 13, 8),
    ("ZPL_PARENT", 7, 8),
    ("ZPL_FLAGS", 11, 8),
    ("ZPL_ATIME", 0, 16),
    ("ZPL_MTIME", 1, 16),
    ("ZPL_CTIME", 2, 16),
    ("ZPL_CRTIME", 3, 16),
    ("ZPL_LINKS", 8, 8),
];

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn fletcher4(data: &[u8]) -> [u64; 4] {
    let f = Fletcher4::parse(data).expect("whole 32-bit words").1;
    [f.a, f.b, f.c, f.d]
}

// ---------------------------------------------------------------------------------------------
// block pointers and devices

/// Fields of one block pointer. A pointer without DVAs is a hole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpSpec {
    pub level: u8,
    pub kind: u8,
    pub lsize: u64,
    pub psize: u64,
    pub checksum: u8,
    pub compression: u8,
    pub dedup: bool,
    pub birth: u64,
    pub phys_birth: u64,
    pub fill: u64,
    /// `(vdev, offset in bytes, asize in bytes, gang)`
    pub dvas: Vec<(u32, u64, u64, bool)>,
    pub checksum_words: [u64; 4],
}

impl Default for BpSpec {
    fn default() -> Self {
        Self {
            level: 0,
            kind: 0,
            lsize: 512,
            psize: 512,
            checksum: CHECKSUM_FLETCHER4,
            compression: COMPRESS_OFF,
            dedup: false,
            birth: 0,
            phys_birth: 0,
            fill: 1,
            dvas: vec![],
            checksum_words: [0; 4],
        }
    }
}

impl BpSpec {
    fn hole(kind: u8, level: u8, lsize: u64) -> Self {
        Self {
            level,
            kind,
            lsize,
            psize: lsize,
            fill: 0,
            ..Self::default()
        }
    }
    pub fn is_hole(&self) -> bool {
        self.dvas.is_empty()
    }
    pub fn parse(&self) -> BlockPtr {
        BlockPtr::parse(&encode_blkptr(self)).expect("128 bytes").1
    }
}

pub fn encode_blkptr(spec: &BpSpec) -> Vec<u8> {
    let mut out = vec![0u8; 128];
    for (i, (vdev, offset, asize, gang)) in spec.dvas.iter().take(3).enumerate() {
        let w0 = ((asize >> 9) & 0xff_ffff) | ((*vdev as u64) << 32);
        let w1 = (offset >> 9) | if *gang { 1 << 63 } else { 0 };
        put_u64(&mut out, i * 16, w0);
        put_u64(&mut out, i * 16 + 8, w1);
    }
    let prop = ((spec.lsize >> 9).saturating_sub(1) & 0xffff)
        | (((spec.psize >> 9).saturating_sub(1) & 0xffff) << 16)
        | ((spec.compression as u64 & 0x7f) << 32)
        | ((spec.checksum as u64) << 40)
        | ((spec.kind as u64) << 48)
        | ((spec.level as u64 & 0x1f) << 56)
        | if spec.dedup { 1 << 62 } else { 0 }
        | 1 << 63;
    put_u64(&mut out, 48, prop);
    put_u64(&mut out, 72, spec.phys_birth);
    put_u64(&mut out, 80, spec.birth);
    put_u64(&mut out, 88, spec.fill);
    for (i, w) in spec.checksum_words.iter().enumerate() {
        put_u64(&mut out, 96 + i * 8, *w);
    }
    out
}

/// A device held in memory
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl RawDevice for MemDisk {
    type Block = Vec<u8>;
    fn read_raw(&self, addr: u64, size: u64) -> IoResult<Self::Block> {
        let end = addr.checked_add(size).filter(|e| *e <= self.data.len() as u64);
        match end {
            Some(end) => Ok(self.data[addr as usize..end as usize].to_vec()),
            None => Err(IoError::new(IoErrorKind::UnexpectedEof, "read past end of disk")),
        }
    }
}

/// Appends blocks to the allocatable area of in-memory vdevs and hands back their pointers
#[derive(Debug, Clone, Default)]
pub struct BlockWriter {
    areas: BTreeMap<u32, Vec<u8>>,
    pub birth: u64,
}

impl BlockWriter {
    pub fn new() -> Self {
        Self {
            areas: BTreeMap::new(),
            birth: 1,
        }
    }

    fn append(&mut self, vdev: u32, block: &[u8]) -> u64 {
        let area = self.areas.entry(vdev).or_insert_with(Vec::new);
        let offset = area.len() as u64;
        area.extend_from_slice(block);
        offset
    }

    /// Store `data`, zero padded to whole sectors, uncompressed with a Fletcher-4 checksum
    pub fn write(&mut self, vdev: u32, kind: u8, level: u8, data: &[u8]) -> BpSpec {
        let mut block = data.to_vec();
        let len = ((block.len().max(1) + 511) / 512) * 512;
        block.resize(len, 0);
        let offset = self.append(vdev, &block);
        BpSpec {
            level,
            kind,
            lsize: len as u64,
            psize: len as u64,
            birth: self.birth,
            dvas: vec![(vdev, offset, len as u64, false)],
            checksum_words: fletcher4(&block),
            ..BpSpec::default()
        }
    }

    /// A gang header over `children` whose reassembled contents are `whole`
    pub fn write_gang(&mut self, children: &[BpSpec], whole: &[u8]) -> BpSpec {
        let mut header = vec![0u8; 512];
        for (i, child) in children.iter().take(3).enumerate() {
            header[i * 128..(i + 1) * 128].copy_from_slice(&encode_blkptr(child));
        }
        put_u64(&mut header, 512 - 40, ZEC_MAGIC);
        let offset = self.append(0, &header);
        BpSpec {
            lsize: whole.len() as u64,
            psize: whole.len() as u64,
            birth: self.birth,
            dvas: vec![(0, offset, 512, true)],
            checksum_words: fletcher4(whole),
            ..BpSpec::default()
        }
    }

    /// One raw image per top-level vdev, labels first when given
    fn into_images(self, label: Option<&[u8]>) -> Vec<Vec<u8>> {
        let top = self.areas.keys().next_back().copied().unwrap_or(0);
        let mut areas = self.areas;
        (0..=top)
            .map(|vdev| {
                let area = areas.remove(&vdev).unwrap_or_default();
                let mut disk = vec![0u8; VDEV_DATA_OFFSET as usize];
                if let Some(label) = label {
                    disk[..label.len()].copy_from_slice(label);
                    let second = LABEL_SIZE as usize;
                    disk[second..second + label.len()].copy_from_slice(label);
                }
                disk.extend_from_slice(&area);
                disk
            })
            .collect()
    }

    fn into_disks(self, label: Option<&[u8]>) -> Vec<Vec<MemDisk>> {
        self.into_images(label)
            .into_iter()
            .map(|image| vec![MemDisk::new(image)])
            .collect()
    }

    pub fn into_vdevs(self) -> VdevSet<MemDisk> {
        VdevSet::from_vdevs(self.into_disks(None))
    }
}

/// Lay `blocks` out as level-0 blocks under as many indirect levels as it takes to end in one
/// top-level pointer. Returns that pointer and the level count.
fn write_tree(
    writer: &mut BlockWriter,
    kind: u8,
    blocks: &[Option<Vec<u8>>],
    bs: u64,
    indirect_shift: u8,
) -> (BpSpec, u8) {
    let mut bps: Vec<BpSpec> = blocks
        .iter()
        .map(|b| match b {
            Some(data) => {
                let mut data = data.clone();
                data.resize(bs as usize, 0);
                writer.write(0, kind, 0, &data)
            }
            None => BpSpec::hole(kind, 0, bs),
        })
        .collect();
    if bps.is_empty() {
        bps.push(BpSpec::hole(kind, 0, bs));
    }
    let per = 1usize << (indirect_shift - 7);
    let ind_size = 1u64 << indirect_shift;
    let mut level = 0u8;
    while bps.len() > 1 {
        level += 1;
        let mut parents = Vec::with_capacity(bps.len() / per + 1);
        for chunk in bps.chunks(per) {
            if chunk.iter().all(BpSpec::is_hole) {
                parents.push(BpSpec::hole(kind, level, ind_size));
                continue;
            }
            let mut raw = Vec::with_capacity(ind_size as usize);
            for bp in chunk {
                raw.extend_from_slice(&encode_blkptr(bp));
            }
            raw.resize(ind_size as usize, 0);
            parents.push(writer.write(0, kind, level, &raw));
        }
        bps = parents;
    }
    (bps.remove(0), level + 1)
}

// ---------------------------------------------------------------------------------------------
// dnodes

#[derive(Debug, Clone)]
pub struct DnodeSpec {
    pub kind: u8,
    pub bonus_type: u8,
    pub flags: u8,
    pub extra_slots: u8,
    pub used: u64,
    pub max_block_id: u64,
    pub datablkszsec: u16,
    pub indblkshift: u8,
    pub levels: u8,
    pub bonus: Vec<u8>,
    /// Empty encodes a single hole
    pub blkptrs: Vec<BpSpec>,
    pub spill: Option<BpSpec>,
}

impl Default for DnodeSpec {
    fn default() -> Self {
        Self {
            kind: 0,
            bonus_type: 0,
            flags: 0,
            extra_slots: 0,
            used: 0,
            max_block_id: 0,
            datablkszsec: 1,
            indblkshift: DEFAULT_INDIRECT_SHIFT,
            levels: 1,
            bonus: vec![],
            blkptrs: vec![],
            spill: None,
        }
    }
}

pub fn encode_dnode(spec: &DnodeSpec) -> Vec<u8> {
    let size = (spec.extra_slots as usize + 1) * DNODE_SIZE;
    let mut out = vec![0u8; size];
    let nblkptr = spec.blkptrs.len().max(1);
    out[0] = spec.kind;
    out[1] = spec.indblkshift;
    out[2] = spec.levels;
    out[3] = nblkptr as u8;
    out[4] = spec.bonus_type;
    out[5] = CHECKSUM_FLETCHER4;
    out[6] = COMPRESS_OFF;
    out[7] = spec.flags;
    put_u16(&mut out, 8, spec.datablkszsec);
    put_u16(&mut out, 10, spec.bonus.len() as u16);
    out[12] = spec.extra_slots;
    put_u64(&mut out, 16, spec.max_block_id);
    put_u64(&mut out, 24, spec.used);
    for (i, bp) in spec.blkptrs.iter().enumerate() {
        let at = 64 + i * 128;
        out[at..at + 128].copy_from_slice(&encode_blkptr(bp));
    }
    let bonus_at = 64 + nblkptr * 128;
    out[bonus_at..bonus_at + spec.bonus.len()].copy_from_slice(&spec.bonus);
    if spec.flags & DNODE_FLAG_SPILL_BLKPTR != 0 {
        if let Some(spill) = &spec.spill {
            out[size - 128..].copy_from_slice(&encode_blkptr(spill));
        }
    }
    out
}

// ---------------------------------------------------------------------------------------------
// name/value lists

/// Builds XDR nvlists the way labels store them
#[derive(Debug, Clone, Default)]
pub struct NvEncoder {
    pairs: Vec<u8>,
}

fn xdr_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize((bytes.len() + 3) / 4 * 4, 0);
    out
}

fn xdr_string(s: &str) -> Vec<u8> {
    let mut out = (s.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(&xdr_bytes(s.as_bytes()));
    out
}

impl NvEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn pair(&mut self, name: &str, kind: u32, nelem: u32, value: &[u8]) -> &mut Self {
        let mut body = xdr_string(name);
        body.extend_from_slice(&kind.to_be_bytes());
        body.extend_from_slice(&nelem.to_be_bytes());
        body.extend_from_slice(value);
        let size = (body.len() + 8) as u32;
        self.pairs.extend_from_slice(&size.to_be_bytes());
        self.pairs.extend_from_slice(&size.to_be_bytes());
        self.pairs.extend_from_slice(&body);
        self
    }

    pub fn uint64(&mut self, name: &str, v: u64) -> &mut Self {
        self.pair(name, 8, 1, &v.to_be_bytes())
    }
    pub fn string(&mut self, name: &str, s: &str) -> &mut Self {
        self.pair(name, 9, 1, &xdr_string(s))
    }
    pub fn boolean(&mut self, name: &str) -> &mut Self {
        self.pair(name, 1, 0, &[])
    }
    pub fn nvlist(&mut self, name: &str, list: &NvEncoder) -> &mut Self {
        self.pair(name, 19, 1, &list.body())
    }
    pub fn nvlist_array(&mut self, name: &str, lists: &[&NvEncoder]) -> &mut Self {
        let mut value = vec![];
        for l in lists {
            value.extend_from_slice(&l.body());
        }
        self.pair(name, 20, lists.len() as u32, &value)
    }
    pub fn raw_pair(&mut self, name: &str, kind: u32, nelem: u32, bytes: &[u8]) -> &mut Self {
        self.pair(name, kind, nelem, &xdr_bytes(bytes))
    }

    fn body(&self) -> Vec<u8> {
        let mut out = 0i32.to_be_bytes().to_vec();
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&self.pairs);
        out.extend_from_slice(&[0u8; 8]);
        out
    }

    /// Stream header (XDR, little-endian host) followed by the list
    pub fn packed(&self) -> Vec<u8> {
        let mut out = vec![1u8, 1, 0, 0];
        out.extend_from_slice(&self.body());
        out
    }
}

// ---------------------------------------------------------------------------------------------
// ZAP

pub fn encode_microzap(salt: u64, bs: usize, entries: &[(&str, u64)]) -> Vec<u8> {
    let mut out = vec![0u8; bs];
    put_u64(&mut out, 0, ZBT_MICRO);
    put_u64(&mut out, 8, salt);
    let mut seen = vec![];
    for (i, (name, value)) in entries.iter().enumerate() {
        let base = 64 + i * 64;
        let hash = zap_hash(salt, name.as_bytes(), 28);
        let cd = seen.iter().filter(|h| **h == hash).count() as u32;
        seen.push(hash);
        put_u64(&mut out, base, *value);
        put_u32(&mut out, base + 8, cd);
        out[base + 14..base + 14 + name.len()].copy_from_slice(name.as_bytes());
    }
    out
}

type HashedEntry = (ZapKey, u8, Vec<u8>, u64);

fn push_array(chunks: &mut Vec<[u8; 24]>, bytes: &[u8]) -> u16 {
    let first = chunks.len();
    let pieces: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[]]
    } else {
        bytes.chunks(21).collect()
    };
    let n = pieces.len();
    for (i, piece) in pieces.into_iter().enumerate() {
        let mut c = [0u8; 24];
        c[0] = 251;
        c[1..1 + piece.len()].copy_from_slice(piece);
        let next = if i + 1 == n {
            ZAP_CHAIN_END
        } else {
            (first + i + 1) as u16
        };
        c[22..24].copy_from_slice(&next.to_le_bytes());
        chunks.push(c);
    }
    first as u16
}

fn encode_leaf(bs: usize, prefix: u64, prefix_len: u16, entries: &[HashedEntry]) -> Vec<u8> {
    let nhash = bs / 32;
    let hash_shift = nhash.trailing_zeros();
    let nchunks = zap_leaf_numchunks(bs);
    let mut table = vec![ZAP_CHAIN_END; nhash];
    let mut chunks: Vec<[u8; 24]> = vec![];
    let mut seen = vec![];
    for (key, int_size, value, hash) in entries {
        let cd = seen.iter().filter(|h| *h == hash).count() as u32;
        seen.push(*hash);
        let entry_idx = chunks.len();
        chunks.push([0u8; 24]);
        let (name, name_len) = match key {
            ZapKey::Str(s) => {
                let mut n = s.clone();
                n.push(0);
                (n, s.len() + 1)
            }
            ZapKey::Ints(v) => (v.iter().flat_map(|w| w.to_be_bytes()).collect(), v.len()),
        };
        let name_chunk = push_array(&mut chunks, &name);
        let value_chunk = push_array(&mut chunks, value);
        let bucket =
            ((hash >> (64 - hash_shift - prefix_len as u32)) & ((1 << hash_shift) - 1)) as usize;
        let next = table[bucket];
        table[bucket] = entry_idx as u16;
        let c = &mut chunks[entry_idx];
        c[0] = 252;
        c[1] = *int_size;
        c[2..4].copy_from_slice(&next.to_le_bytes());
        c[4..6].copy_from_slice(&name_chunk.to_le_bytes());
        c[6..8].copy_from_slice(&(name_len as u16).to_le_bytes());
        c[8..10].copy_from_slice(&value_chunk.to_le_bytes());
        c[10..12].copy_from_slice(&((value.len() / (*int_size).max(1) as usize) as u16).to_le_bytes());
        c[12..16].copy_from_slice(&cd.to_le_bytes());
        c[16..24].copy_from_slice(&hash.to_le_bytes());
    }
    assert!(chunks.len() <= nchunks, "fixture leaf overflow");
    let used = chunks.len();
    for i in used..nchunks {
        let mut c = [0u8; 24];
        c[0] = 253;
        let next = if i + 1 == nchunks {
            ZAP_CHAIN_END
        } else {
            (i + 1) as u16
        };
        c[22..24].copy_from_slice(&next.to_le_bytes());
        chunks.push(c);
    }

    let mut out = vec![0u8; 48];
    put_u64(&mut out, 0, ZBT_LEAF);
    put_u64(&mut out, 16, prefix);
    put_u32(&mut out, 24, ZAP_LEAF_MAGIC);
    put_u16(&mut out, 28, (nchunks - used) as u16);
    put_u16(&mut out, 30, entries.len() as u16);
    put_u16(&mut out, 32, prefix_len);
    let freelist = if used < nchunks {
        used as u16
    } else {
        ZAP_CHAIN_END
    };
    put_u16(&mut out, 34, freelist);
    for t in &table {
        out.extend_from_slice(&t.to_le_bytes());
    }
    for c in &chunks {
        out.extend_from_slice(c);
    }
    out.resize(bs, 0);
    out
}

/// One leaf with prefix length zero; `hash` picks each entry's hash
pub fn encode_fatzap_leaf<F>(bs: usize, values: &[(ZapKey, u8, Vec<u8>)], hash: F) -> Vec<u8>
where
    F: Fn(&ZapKey) -> u64,
{
    let hashed: Vec<HashedEntry> = values
        .iter()
        .map(|(k, i, v)| (k.clone(), *i, v.clone(), hash(k)))
        .collect();
    encode_leaf(bs, 0, 0, &hashed)
}

fn prefix_of(hash: u64, len: u32) -> u64 {
    if len == 0 {
        0
    } else {
        hash >> (64 - len)
    }
}

/// Header block followed by leaf blocks, with the pointer table embedded in the header
pub fn encode_fatzap(
    bs: usize,
    salt: u64,
    entries: &[(ZapKey, u8, Vec<u8>)],
    flags: u64,
) -> Vec<Vec<u8>> {
    let hashbits = if flags & ZAP_FLAG_HASH64 != 0 { 48 } else { 28 };
    let hashed: Vec<HashedEntry> = entries
        .iter()
        .map(|(k, i, v)| {
            let h = match k {
                ZapKey::Str(s) => zap_hash(salt, s, hashbits),
                ZapKey::Ints(n) => zap_hash_u64(salt, n, hashbits),
            };
            (k.clone(), *i, v.clone(), h)
        })
        .collect();
    let tbl_shift = (bs / 16).trailing_zeros();
    let mut prefix_len = 0u32;
    loop {
        let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
        for e in &hashed {
            *counts.entry(prefix_of(e.3, prefix_len)).or_insert(0) += 1;
        }
        let fullest = counts.values().copied().max().unwrap_or(0);
        if fullest <= FIXTURE_LEAF_ENTRIES || prefix_len == tbl_shift {
            break;
        }
        prefix_len += 1;
    }
    let nleaves = 1u64 << prefix_len;

    let half = bs / 2;
    let mut header = vec![0u8; half];
    let words = [
        ZBT_HEADER,
        ZAP_MAGIC,
        0,
        0,
        tbl_shift as u64,
        0,
        0,
        1 + nleaves,
        nleaves,
        hashed.len() as u64,
        salt,
        0,
        flags,
    ];
    for (i, w) in words.iter().enumerate() {
        put_u64(&mut header, i * 8, *w);
    }
    for i in 0..(half / 8) as u64 {
        let leaf = 1 + (i >> (tbl_shift - prefix_len));
        header.extend_from_slice(&leaf.to_le_bytes());
    }

    let mut blocks = vec![header];
    for g in 0..nleaves {
        let group: Vec<HashedEntry> = hashed
            .iter()
            .filter(|e| prefix_of(e.3, prefix_len) == g)
            .cloned()
            .collect();
        blocks.push(encode_leaf(bs, g, prefix_len as u16, &group));
    }
    blocks
}

// ---------------------------------------------------------------------------------------------
// DSL and ZPL records

#[derive(Debug, Clone, Default)]
pub struct DirSpec {
    pub head_dataset_obj: u64,
    pub parent_obj: u64,
    pub origin_obj: u64,
    pub child_dir_zapobj: u64,
    pub props_zapobj: u64,
}

pub fn encode_dsl_dir(spec: &DirSpec) -> Vec<u8> {
    let mut out = vec![0u8; 256];
    put_u64(&mut out, 8, spec.head_dataset_obj);
    put_u64(&mut out, 16, spec.parent_obj);
    put_u64(&mut out, 24, spec.origin_obj);
    put_u64(&mut out, 32, spec.child_dir_zapobj);
    put_u64(&mut out, 80, spec.props_zapobj);
    out
}

#[derive(Debug, Clone, Default)]
pub struct DatasetSpec {
    pub dir_obj: u64,
    pub prev_snap_obj: u64,
    pub next_snap_obj: u64,
    pub snapnames_zapobj: u64,
    pub creation_time: u64,
    pub creation_txg: u64,
    pub referenced_bytes: u64,
    pub unique_bytes: u64,
    pub guid: u64,
    pub bp: BpSpec,
}

pub fn encode_dsl_dataset(spec: &DatasetSpec) -> Vec<u8> {
    let mut out = vec![0u8; 320];
    put_u64(&mut out, 0, spec.dir_obj);
    put_u64(&mut out, 8, spec.prev_snap_obj);
    put_u64(&mut out, 24, spec.next_snap_obj);
    put_u64(&mut out, 32, spec.snapnames_zapobj);
    put_u64(&mut out, 48, spec.creation_time);
    put_u64(&mut out, 56, spec.creation_txg);
    put_u64(&mut out, 72, spec.referenced_bytes);
    put_u64(&mut out, 96, spec.unique_bytes);
    put_u64(&mut out, 112, spec.guid);
    out[128..256].copy_from_slice(&encode_blkptr(&spec.bp));
    out
}

/// POSIX attributes of one fixture znode
#[derive(Debug, Clone, Default)]
pub struct ZnodeSpec {
    pub mode: u64,
    pub size: u64,
    pub gen: u64,
    pub uid: u64,
    pub gid: u64,
    pub parent: u64,
    pub links: u64,
    pub mtime: u64,
}

/// System attribute bonus in the fixture layout
pub fn encode_sa_znode(z: &ZnodeSpec) -> Vec<u8> {
    let mut out = vec![0u8; 8];
    put_u32(&mut out, 0, SA_MAGIC);
    put_u16(&mut out, 4, (1 << 10) | FIXTURE_SA_LAYOUT);
    let scalars = [z.mode, z.size, z.gen, z.uid, z.gid, z.parent, 0];
    for v in &scalars {
        out.extend_from_slice(&v.to_le_bytes());
    }
    for _ in 0..4 {
        out.extend_from_slice(&z.mtime.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
    }
    out.extend_from_slice(&z.links.to_le_bytes());
    out
}

/// Pre-SA bonus: four timestamps then the scalar fields, followed by an empty ACL
pub fn encode_legacy_znode(z: &ZnodeSpec) -> Vec<u8> {
    let mut out = vec![];
    for _ in 0..4 {
        out.extend_from_slice(&z.mtime.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
    }
    let words = [z.gen, z.mode, z.size, z.parent, z.links, 0, 0, 0, z.uid, z.gid, 0];
    for w in &words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out.resize(264, 0);
    out
}

// ---------------------------------------------------------------------------------------------
// space maps

fn op_bit(op: SmOp) -> u64 {
    match op {
        SmOp::Alloc => 0,
        SmOp::Free => 1,
    }
}

pub fn sm_debug(action: u64, sync_pass: u64, txg: u64) -> u64 {
    (1 << 63) | ((action & 3) << 60) | ((sync_pass & 0x3ff) << 50) | (txg & ((1 << 50) - 1))
}

/// Offset and run in 512-byte units
pub fn sm_one_word(op: SmOp, offset: u64, run: u64) -> u64 {
    (offset << 16) | (op_bit(op) << 15) | ((run - 1) & 0x7fff)
}

pub fn sm_two_word(op: SmOp, offset: u64, run: u64, vdev: u32) -> [u64; 2] {
    [
        (0b11 << 62) | (((run - 1) & ((1 << 36) - 1)) << 24) | (vdev as u64 & 0xff_ffff),
        (op_bit(op) << 63) | offset,
    ]
}

// ---------------------------------------------------------------------------------------------
// pool builder

#[derive(Debug, Clone)]
enum Body {
    /// Block pointers exactly as given
    Plain,
    Data {
        blocks: Vec<Option<Vec<u8>>>,
        bs: u64,
        indirect_shift: u8,
    },
    Micro(Vec<(String, u64)>),
    Fat {
        entries: Vec<(ZapKey, u8, Vec<u8>)>,
        flags: u64,
    },
}

#[derive(Debug, Clone)]
enum Bonus {
    Raw,
    Dataset { fs: Option<usize>, spec: DatasetSpec },
    Dir(DirSpec),
    Sa(ZnodeSpec),
    Znode(ZnodeSpec),
    SpaceMap { length: u64 },
}

#[derive(Debug, Clone)]
struct Pending {
    spec: DnodeSpec,
    body: Body,
    bonus: Bonus,
}

impl Pending {
    fn new(spec: DnodeSpec, body: Body, bonus: Bonus) -> Self {
        Self { spec, body, bonus }
    }
}

#[derive(Debug, Clone)]
struct ObjsetBuilder {
    os_type: u64,
    objects: BTreeMap<u64, Pending>,
    next_id: u64,
}

impl ObjsetBuilder {
    fn new(os_type: u64) -> Self {
        Self {
            os_type,
            objects: BTreeMap::new(),
            next_id: 2,
        }
    }

    fn alloc(&mut self, p: Pending) -> u64 {
        let slots = p.spec.extra_slots as u64 + 1;
        let mut id = self.next_id;
        if id % DNODES_PER_BLOCK + slots > DNODES_PER_BLOCK {
            id = (id / DNODES_PER_BLOCK + 1) * DNODES_PER_BLOCK;
        }
        self.next_id = id + slots;
        self.objects.insert(id, p);
        id
    }

    fn place(&mut self, id: u64, p: Pending) -> u64 {
        let slots = p.spec.extra_slots as u64 + 1;
        self.next_id = self.next_id.max(id + slots);
        self.objects.insert(id, p);
        id
    }

    fn micro_insert(&mut self, obj: u64, name: &str, value: u64) {
        if let Some(Pending {
            body: Body::Micro(entries),
            ..
        }) = self.objects.get_mut(&obj)
        {
            entries.retain(|(n, _)| n != name);
            entries.push((name.to_string(), value));
        }
    }
}

fn zap_salt(obj: u64) -> u64 {
    0x5a17_0000_0000 | obj
}

fn micro_spec(kind: u8) -> DnodeSpec {
    DnodeSpec {
        kind,
        datablkszsec: (ZAP_BLOCK_SIZE / 512) as u16,
        ..DnodeSpec::default()
    }
}

/// Builds a pool image: the MOS plus any number of filesystem objsets
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    writer: BlockWriter,
    txg: u64,
    mos: ObjsetBuilder,
    filesystems: Vec<ObjsetBuilder>,
    /// `(master node, SA attrs)` of each filesystem, by handle
    fs_roots: Vec<u64>,
    /// Config `error_count`, left out when zero
    error_count: u64,
}

impl PoolBuilder {
    pub fn new() -> Self {
        let txg = 100;
        let mut writer = BlockWriter::new();
        writer.birth = txg;
        Self {
            writer,
            txg,
            mos: ObjsetBuilder::new(1),
            filesystems: vec![],
            fs_roots: vec![],
            error_count: 0,
        }
    }

    pub fn set_error_count(&mut self, count: u64) {
        self.error_count = count;
    }

    pub fn txg(&self) -> u64 {
        self.txg
    }

    fn objset_mut(&mut self, fs: Option<usize>) -> &mut ObjsetBuilder {
        match fs {
            Some(i) => &mut self.filesystems[i],
            None => &mut self.mos,
        }
    }

    /// The MOS object directory at object 1, a microzap of `entries`
    pub fn mos_object_directory(&mut self, entries: &[(&str, u64)]) -> u64 {
        let entries = entries.iter().map(|(n, v)| (n.to_string(), *v)).collect();
        self.mos.place(
            1,
            Pending::new(
                micro_spec(DMU_OT_OBJECT_DIRECTORY),
                Body::Micro(entries),
                Bonus::Raw,
            ),
        )
    }

    pub fn mos_object(&mut self, spec: DnodeSpec) -> u64 {
        self.mos.alloc(Pending::new(spec, Body::Plain, Bonus::Raw))
    }

    pub fn mos_object_at(&mut self, id: u64, spec: DnodeSpec) -> u64 {
        self.mos.place(id, Pending::new(spec, Body::Plain, Bonus::Raw))
    }

    pub fn mos_data_object(
        &mut self,
        kind: u8,
        blocks: Vec<Option<Vec<u8>>>,
        bs: u64,
        indirect_shift: u8,
    ) -> u64 {
        let spec = DnodeSpec {
            kind,
            ..DnodeSpec::default()
        };
        self.mos.alloc(Pending::new(
            spec,
            Body::Data {
                blocks,
                bs,
                indirect_shift,
            },
            Bonus::Raw,
        ))
    }

    pub fn mos_microzap(&mut self, kind: u8, entries: &[(&str, u64)]) -> u64 {
        let entries = entries.iter().map(|(n, v)| (n.to_string(), *v)).collect();
        self.mos
            .alloc(Pending::new(micro_spec(kind), Body::Micro(entries), Bonus::Raw))
    }

    pub fn mos_fatzap(&mut self, kind: u8, entries: &[(ZapKey, u8, Vec<u8>)], flags: u64) -> u64 {
        self.mos.alloc(Pending::new(
            micro_spec(kind),
            Body::Fat {
                entries: entries.to_vec(),
                flags,
            },
            Bonus::Raw,
        ))
    }

    /// A space map object holding `words`, in 512-byte blocks
    pub fn mos_spacemap(&mut self, words: &[u64]) -> u64 {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let blocks = bytes.chunks(512).map(|c| Some(c.to_vec())).collect();
        let spec = DnodeSpec {
            kind: DMU_OT_SPACE_MAP,
            bonus_type: DMU_OT_SPACE_MAP_HEADER,
            ..DnodeSpec::default()
        };
        self.mos.alloc(Pending::new(
            spec,
            Body::Data {
                blocks,
                bs: 512,
                indirect_shift: DEFAULT_INDIRECT_SHIFT,
            },
            Bonus::SpaceMap {
                length: bytes.len() as u64,
            },
        ))
    }

    /// A DSL directory with an empty child map. A zero parent makes it the pool's root
    /// directory.
    pub fn dsl_dir(&mut self, parent: u64, name: &str) -> u64 {
        let children = self.mos_microzap(DMU_OT_DSL_DIR_CHILD_MAP, &[]);
        let spec = DnodeSpec {
            kind: DMU_OT_DSL_DIR,
            bonus_type: DMU_OT_DSL_DIR,
            ..DnodeSpec::default()
        };
        let dir = self.mos.alloc(Pending::new(
            spec,
            Body::Plain,
            Bonus::Dir(DirSpec {
                parent_obj: parent,
                child_dir_zapobj: children,
                ..DirSpec::default()
            }),
        ));
        if parent == 0 {
            self.mos.micro_insert(1, "root_dataset", dir);
        } else if let Some(Pending {
            bonus: Bonus::Dir(p),
            ..
        }) = self.mos.objects.get(&parent)
        {
            let child_map = p.child_dir_zapobj;
            self.mos.micro_insert(child_map, name, dir);
        }
        dir
    }

    /// Link a DSL directory and its head dataset both ways
    pub fn set_dir_head(&mut self, dir: u64, ds: u64) {
        if let Some(Pending {
            bonus: Bonus::Dir(d),
            ..
        }) = self.mos.objects.get_mut(&dir)
        {
            d.head_dataset_obj = ds;
        }
        self.with_dataset(ds, |spec| spec.dir_obj = dir);
    }

    /// Record `snap` under `name` in the snapshot map of `head`
    pub fn snapshot(&mut self, head: u64, name: &str, snap: u64) {
        let mut map = 0;
        self.with_dataset(head, |spec| map = spec.snapnames_zapobj);
        if map == 0 {
            map = self.mos_microzap(DMU_OT_DSL_DS_SNAP_MAP, &[]);
            self.with_dataset(head, |spec| spec.snapnames_zapobj = map);
        }
        self.mos.micro_insert(map, name, snap);
    }

    fn with_dataset<F: FnOnce(&mut DatasetSpec)>(&mut self, ds: u64, f: F) {
        if let Some(Pending {
            bonus: Bonus::Dataset { spec, .. },
            ..
        }) = self.mos.objects.get_mut(&ds)
        {
            f(spec);
        }
    }

    /// A DSL dataset whose objset is filesystem `fs`
    pub fn dataset(&mut self, fs: usize, prev: u64, next: u64, txg: u64) -> u64 {
        self.dataset_inner(Some(fs), prev, next, txg)
    }

    pub fn dataset_without_objset(&mut self, txg: u64) -> u64 {
        self.dataset_inner(None, 0, 0, txg)
    }

    fn dataset_inner(&mut self, fs: Option<usize>, prev: u64, next: u64, txg: u64) -> u64 {
        let spec = DnodeSpec {
            kind: DMU_OT_DSL_DATASET,
            bonus_type: DMU_OT_DSL_DATASET,
            ..DnodeSpec::default()
        };
        let ds = DatasetSpec {
            prev_snap_obj: prev,
            next_snap_obj: next,
            creation_txg: txg,
            creation_time: 1_600_000_000 + txg,
            referenced_bytes: txg * 1024,
            unique_bytes: txg * 512,
            ..DatasetSpec::default()
        };
        let id = self
            .mos
            .alloc(Pending::new(spec, Body::Plain, Bonus::Dataset { fs, spec: ds }));
        self.with_dataset(id, |s| s.guid = 0xd5_0000 + id);
        id
    }

    pub fn set_next_snap(&mut self, ds: u64, next: u64) {
        self.with_dataset(ds, |s| s.next_snap_obj = next);
    }

    pub fn set_prev_snap(&mut self, ds: u64, prev: u64) {
        self.with_dataset(ds, |s| s.prev_snap_obj = prev);
    }

    /// A new filesystem objset with its master node and SA bookkeeping. Returns its handle.
    pub fn filesystem(&mut self) -> usize {
        let mut os = ObjsetBuilder::new(2);
        os.place(
            1,
            Pending::new(
                micro_spec(DMU_OT_MASTER_NODE),
                Body::Micro(vec![("VERSION".to_string(), 5)]),
                Bonus::Raw,
            ),
        );
        let registry: Vec<(String, u64)> = FIXTURE_SA_REGISTRY
            .iter()
            .map(|(name, num, len)| {
                let phys = SAAttrPhys::new(*num, *len, SAByteswapType::U64Array);
                (name.to_string(), phys.0)
            })
            .collect();
        let registry = os.alloc(Pending::new(
            micro_spec(DMU_OT_SA_ATTR_REGISTRATION),
            Body::Micro(registry),
            Bonus::Raw,
        ));
        let layout: Vec<u8> = FIXTURE_SA_ATTRS
            .iter()
            .flat_map(|a| a.to_be_bytes())
            .collect();
        let layouts = os.alloc(Pending::new(
            micro_spec(DMU_OT_SA_ATTR_LAYOUTS),
            Body::Fat {
                entries: vec![(
                    ZapKey::Str(FIXTURE_SA_LAYOUT.to_string().into_bytes()),
                    2,
                    layout,
                )],
                flags: 0,
            },
            Bonus::Raw,
        ));
        let sa = os.alloc(Pending::new(
            micro_spec(DMU_OT_SA_MASTER_NODE),
            Body::Micro(vec![
                ("REGISTRY".to_string(), registry),
                ("LAYOUTS".to_string(), layouts),
            ]),
            Bonus::Raw,
        ));
        let delete_queue = os.alloc(Pending::new(
            micro_spec(DMU_OT_ZFS_DELETE_QUEUE),
            Body::Micro(vec![]),
            Bonus::Raw,
        ));
        os.micro_insert(1, "SA_ATTRS", sa);
        os.micro_insert(1, "DELETE_QUEUE", delete_queue);
        self.filesystems.push(os);
        self.fs_roots.push(0);
        self.filesystems.len() - 1
    }

    fn fs_directory(&mut self, fs: usize, parent: u64) -> u64 {
        let spec = DnodeSpec {
            bonus_type: DMU_OT_SA,
            ..micro_spec(DMU_OT_DIRECTORY_CONTENTS)
        };
        let os = &mut self.filesystems[fs];
        let id = os.alloc(Pending::new(spec, Body::Micro(vec![]), Bonus::Raw));
        let z = ZnodeSpec {
            mode: 0o040_755,
            size: 2,
            gen: self.txg,
            parent: if parent == 0 { id } else { parent },
            links: 2,
            mtime: 1_600_000_000,
            ..ZnodeSpec::default()
        };
        if let Some(p) = os.objects.get_mut(&id) {
            p.bonus = Bonus::Sa(z);
        }
        id
    }

    /// The root directory of filesystem `fs`
    pub fn fs_root(&mut self, fs: usize) -> u64 {
        let root = self.fs_directory(fs, 0);
        self.filesystems[fs].micro_insert(1, "ROOT", root);
        self.fs_roots[fs] = root;
        root
    }

    pub fn fs_dir(&mut self, fs: usize, parent: u64, name: &str) -> u64 {
        let dir = self.fs_directory(fs, parent);
        self.filesystems[fs].micro_insert(parent, name, DirEntry::new(4, dir).0);
        dir
    }

    fn fs_file_with(&mut self, fs: usize, parent: u64, name: &str, data: &[u8], sa: bool) -> u64 {
        let blocks: Vec<Option<Vec<u8>>> = data.chunks(512).map(|c| Some(c.to_vec())).collect();
        let z = ZnodeSpec {
            mode: 0o100_644,
            size: data.len() as u64,
            gen: self.txg,
            uid: 1000,
            gid: 1000,
            parent,
            links: 1,
            mtime: 1_600_000_100,
        };
        let (bonus_type, bonus) = if sa {
            (DMU_OT_SA, Bonus::Sa(z))
        } else {
            (DMU_OT_ZNODE, Bonus::Znode(z))
        };
        let spec = DnodeSpec {
            kind: DMU_OT_PLAIN_FILE_CONTENTS,
            bonus_type,
            ..DnodeSpec::default()
        };
        let os = &mut self.filesystems[fs];
        let file = os.alloc(Pending::new(
            spec,
            Body::Data {
                blocks,
                bs: 512,
                indirect_shift: DEFAULT_INDIRECT_SHIFT,
            },
            bonus,
        ));
        os.micro_insert(parent, name, DirEntry::new(8, file).0);
        file
    }

    /// A regular file with system attributes
    pub fn fs_file(&mut self, fs: usize, parent: u64, name: &str, data: &[u8]) -> u64 {
        self.fs_file_with(fs, parent, name, data, true)
    }

    /// A regular file with a pre-SA znode bonus
    pub fn fs_file_legacy(&mut self, fs: usize, parent: u64, name: &str, data: &[u8]) -> u64 {
        self.fs_file_with(fs, parent, name, data, false)
    }

    /// Add `name -> value` to a MOS microzap
    pub fn mos_zap_insert(&mut self, obj: u64, name: &str, value: u64) {
        self.mos.micro_insert(obj, name, value);
    }

    // -----------------------------------------------------------------------------------------

    fn encode_object(
        writer: &mut BlockWriter,
        id: u64,
        p: &Pending,
        fs_roots: &[BpSpec],
    ) -> Vec<u8> {
        let mut spec = p.spec.clone();
        match &p.body {
            Body::Plain => {}
            Body::Data {
                blocks,
                bs,
                indirect_shift,
            } => {
                let (top, levels) = write_tree(writer, spec.kind, blocks, *bs, *indirect_shift);
                spec.used = blocks.iter().flatten().count() as u64 * bs;
                spec.flags |= crate::dmu::DNODE_FLAG_USED_BYTES;
                spec.blkptrs = vec![top];
                spec.levels = levels;
                spec.indblkshift = *indirect_shift;
                spec.datablkszsec = (*bs / 512) as u16;
                spec.max_block_id = blocks.len().saturating_sub(1) as u64;
            }
            Body::Micro(entries) if entries.len() <= MZAP_CHUNKS => {
                let refs: Vec<(&str, u64)> = entries.iter().map(|(n, v)| (n.as_str(), *v)).collect();
                let block = encode_microzap(zap_salt(id), ZAP_BLOCK_SIZE, &refs);
                Self::zap_blocks(writer, &mut spec, vec![block]);
            }
            Body::Micro(entries) => {
                let fat: Vec<(ZapKey, u8, Vec<u8>)> = entries
                    .iter()
                    .map(|(n, v)| (ZapKey::Str(n.clone().into_bytes()), 8, v.to_be_bytes().to_vec()))
                    .collect();
                let blocks = encode_fatzap(ZAP_BLOCK_SIZE, zap_salt(id), &fat, 0);
                Self::zap_blocks(writer, &mut spec, blocks);
            }
            Body::Fat { entries, flags } => {
                let blocks = encode_fatzap(ZAP_BLOCK_SIZE, zap_salt(id), entries, *flags);
                Self::zap_blocks(writer, &mut spec, blocks);
            }
        }
        match &p.bonus {
            Bonus::Raw => {}
            Bonus::Dataset { fs, spec: ds } => {
                let mut ds = ds.clone();
                if let Some(root) = fs.and_then(|i| fs_roots.get(i)) {
                    ds.bp = root.clone();
                }
                spec.bonus = encode_dsl_dataset(&ds);
            }
            Bonus::Dir(d) => spec.bonus = encode_dsl_dir(d),
            Bonus::Sa(z) => spec.bonus = encode_sa_znode(z),
            Bonus::Znode(z) => spec.bonus = encode_legacy_znode(z),
            Bonus::SpaceMap { length } => {
                let mut b = vec![0u8; 24];
                put_u64(&mut b, 0, id);
                put_u64(&mut b, 8, *length);
                spec.bonus = b;
            }
        }
        encode_dnode(&spec)
    }

    fn zap_blocks(writer: &mut BlockWriter, spec: &mut DnodeSpec, blocks: Vec<Vec<u8>>) {
        let n = blocks.len();
        let blocks: Vec<Option<Vec<u8>>> = blocks.into_iter().map(Some).collect();
        let (top, levels) = write_tree(
            writer,
            spec.kind,
            &blocks,
            ZAP_BLOCK_SIZE as u64,
            DEFAULT_INDIRECT_SHIFT,
        );
        spec.blkptrs = vec![top];
        spec.levels = levels;
        spec.datablkszsec = (ZAP_BLOCK_SIZE / 512) as u16;
        spec.max_block_id = n as u64 - 1;
    }

    /// Write every dnode of `os`, the meta dnode over them, and the objset block
    fn write_objset(writer: &mut BlockWriter, os: &ObjsetBuilder, fs_roots: &[BpSpec]) -> BpSpec {
        let mut meta_blocks: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        meta_blocks.insert(0, vec![0u8; META_BLOCK_SIZE as usize]);
        for (id, p) in &os.objects {
            let raw = Self::encode_object(writer, *id, p, fs_roots);
            let block = meta_blocks
                .entry(id / DNODES_PER_BLOCK)
                .or_insert_with(|| vec![0u8; META_BLOCK_SIZE as usize]);
            let at = (id % DNODES_PER_BLOCK) as usize * DNODE_SIZE;
            block[at..at + raw.len()].copy_from_slice(&raw);
        }
        let last = meta_blocks.keys().next_back().copied().unwrap_or(0);
        let blocks: Vec<Option<Vec<u8>>> =
            (0..=last).map(|b| meta_blocks.remove(&b)).collect();
        let (top, levels) = write_tree(
            writer,
            DMU_OT_DNODE,
            &blocks,
            META_BLOCK_SIZE,
            DEFAULT_INDIRECT_SHIFT,
        );
        let meta = DnodeSpec {
            kind: DMU_OT_DNODE,
            levels,
            datablkszsec: (META_BLOCK_SIZE / 512) as u16,
            max_block_id: last,
            blkptrs: vec![top],
            ..DnodeSpec::default()
        };
        let mut block = encode_dnode(&meta);
        block.resize(DNODE_SIZE + 192, 0);
        block.extend_from_slice(&os.os_type.to_le_bytes());
        block.extend_from_slice(&0u64.to_le_bytes());
        block.resize(2048, 0);
        writer.write(0, DMU_OT_OBJSET, 0, &block)
    }

    fn materialize(&self) -> (BlockWriter, BpSpec) {
        let mut writer = self.writer.clone();
        let roots: Vec<BpSpec> = self
            .filesystems
            .iter()
            .map(|os| Self::write_objset(&mut writer, os, &[]))
            .collect();
        let mos = Self::write_objset(&mut writer, &self.mos, &roots);
        (writer, mos)
    }

    fn config(&self, name: &str) -> NvEncoder {
        let mut disk = NvEncoder::new();
        disk.string("type", "disk")
            .uint64("id", 0)
            .uint64("guid", 0x0d15_c000)
            .string("path", "/dev/mem0")
            .uint64("ashift", 9);
        let mut tree = NvEncoder::new();
        tree.string("type", "root")
            .uint64("id", 0)
            .uint64("guid", 0x9001)
            .uint64("ashift", 9)
            .nvlist_array("children", &[&disk]);
        let mut features = NvEncoder::new();
        features
            .boolean("com.delphix:hole_birth")
            .boolean("com.delphix:embedded_data");
        let mut config = NvEncoder::new();
        config
            .uint64("version", 5000)
            .string("name", name)
            .uint64("state", 0)
            .uint64("txg", self.txg)
            .uint64("pool_guid", 0x7a6e_0001)
            .uint64("hostid", 0x00c0_ffee)
            .string("hostname", "testhost")
            .nvlist("vdev_tree", &tree)
            .nvlist("features_for_read", &features);
        if self.error_count != 0 {
            config.uint64("error_count", self.error_count);
        }
        config
    }

    fn uberblock(&self, txg: u64, rootbp: &BpSpec) -> Vec<u8> {
        let mut out = vec![0u8; 1024];
        put_u64(&mut out, 0, UBERBLOCK_MAGIC);
        put_u64(&mut out, 8, 5000);
        put_u64(&mut out, 16, txg);
        put_u64(&mut out, 24, 0x9001);
        put_u64(&mut out, 32, 1_600_000_000 + txg);
        out[40..168].copy_from_slice(&encode_blkptr(rootbp));
        out
    }

    /// Open the pool through its parts, without labels
    pub fn session(&self) -> PoolSession {
        let (writer, root) = self.materialize();
        let raw = self.uberblock(self.txg, &root);
        let uberblock = Uberblock::parse(&raw, raw.len()).expect("1 KiB uberblock").1;
        let config = NvList::unpack(&self.config("tank").packed())
            .expect("valid config")
            .1;
        PoolSession::from_parts(
            "tank".to_string(),
            config,
            uberblock,
            Box::new(writer.into_vdevs()),
        )
        .expect("synthetic pool opens")
    }

    /// A label naming the pool `tank`. An older uberblock sits in the ring next to the active one.
    fn label(&self, root: &BpSpec) -> Vec<u8> {
        let mut label = vec![0u8; LABEL_SIZE as usize];
        let packed = self.config("tank").packed();
        label[16 * 1024..16 * 1024 + packed.len()].copy_from_slice(&packed);
        let ring = 128 * 1024;
        for txg in &[self.txg - 5, self.txg] {
            let slot = (*txg % 128) as usize * 1024;
            label[ring + slot..ring + slot + 1024].copy_from_slice(&self.uberblock(*txg, root));
        }
        label
    }

    /// Write labels and open the pool through them, as `PoolSession::open` would
    pub fn open_via_labels(&self, name: &str) -> Result<PoolSession, ZfsError> {
        let (writer, root) = self.materialize();
        let label = self.label(&root);
        let disks = writer.into_disks(Some(&label));
        PoolSession::open_devices(Some(name), VdevSet::from_vdevs(disks))
    }

    /// Labelled raw images of every top-level vdev, for writing out to files
    pub fn disk_images(&self) -> Vec<Vec<u8>> {
        let (writer, root) = self.materialize();
        let label = self.label(&root);
        writer.into_images(Some(&label))
    }
}

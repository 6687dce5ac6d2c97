//!
//! Resumable iteration over the entries of one ZAP object
//!
//! Entries come back in hash order, the same order for micro and fat maps. A cursor position
//! serializes to `hash | cd`, which stays meaningful across processes because the map itself
//! never changes under a read-only session.
//!
use tracing::trace;

use crate::dmu::DNodePhys;
use crate::limits::ZAP_VALUE_PREVIEW_MAX;
use crate::store::{ObjectStore, Zap};
use crate::zap::{zap_maxcd, ZapEntry, ZapLeafPhys};
use crate::{invalid, ZfsError};

const MZAP_HASHBITS: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Micro(usize),
    Leaf { block: u64, chunk: u16 },
}

#[derive(Debug, Clone, Copy)]
struct Position {
    hash: u64,
    cd: u32,
    loc: Loc,
}

pub struct ZapCursor<'s, 'a> {
    store: &'s ObjectStore<'a>,
    object: u64,
    dnode: DNodePhys,
    zap: Zap,
    positions: Vec<Position>,
    idx: usize,
    leaf: Option<(u64, ZapLeafPhys)>,
}

impl<'s, 'a> ZapCursor<'s, 'a> {
    /// A cursor at the first entry of ZAP object `object`
    pub fn init(store: &'s ObjectStore<'a>, object: u64) -> Result<Self, ZfsError> {
        let dnode = store.get_object(object)?;
        let zap = store.read_zap(&dnode)?;
        let mut positions = match &zap {
            Zap::Micro(m) => m
                .live_entries()
                .map(|(chunk, e)| Position {
                    hash: e.hash(m.salt),
                    cd: e.cd,
                    loc: Loc::Micro(chunk),
                })
                .collect::<Vec<_>>(),
            Zap::Fat(f) => {
                let mut out = vec![];
                for block in store.zap_leaf_blocks(&dnode, f)? {
                    let leaf = store.zap_leaf(&dnode, block)?;
                    out.extend(leaf.entry_positions().into_iter().map(|(hash, cd, chunk)| {
                        Position {
                            hash,
                            cd,
                            loc: Loc::Leaf { block, chunk },
                        }
                    }));
                }
                out
            }
        };
        positions.sort_by_key(|p| (p.hash, p.cd));
        trace!(object, entries = positions.len(), "zap cursor opened");
        Ok(Self {
            store,
            object,
            dnode,
            zap,
            positions,
            idx: 0,
            leaf: None,
        })
    }

    /// A cursor at the first entry whose `(hash, cd)` is not before `token`. Zero starts at
    /// the beginning.
    pub fn init_from_token(
        store: &'s ObjectStore<'a>,
        object: u64,
        token: u64,
    ) -> Result<Self, ZfsError> {
        let mut cursor = Self::init(store, object)?;
        let maxcd = zap_maxcd(cursor.hashbits());
        let hash = token & !(maxcd - 1);
        let cd = token & (maxcd - 1);
        cursor.idx = cursor
            .positions
            .partition_point(|p| (p.hash, p.cd as u64) < (hash, cd));
        Ok(cursor)
    }

    pub fn object(&self) -> u64 {
        self.object
    }
    pub fn zap(&self) -> &Zap {
        &self.zap
    }
    pub fn dnode(&self) -> &DNodePhys {
        &self.dnode
    }
    pub fn is_micro(&self) -> bool {
        self.zap.is_micro()
    }
    /// Whether keys are arrays of integers rather than strings
    pub fn int_keys(&self) -> bool {
        match &self.zap {
            Zap::Micro(_) => false,
            Zap::Fat(f) => f.uint64_keys(),
        }
    }
    fn hashbits(&self) -> u32 {
        match &self.zap {
            Zap::Micro(_) => MZAP_HASHBITS,
            Zap::Fat(f) => f.hashbits(),
        }
    }

    /// The entry under the cursor, or `None` past the last entry
    pub fn retrieve(&mut self) -> Result<Option<ZapEntry>, ZfsError> {
        let pos = match self.positions.get(self.idx) {
            Some(p) => *p,
            None => return Ok(None),
        };
        match pos.loc {
            Loc::Micro(chunk) => match &self.zap {
                Zap::Micro(m) => Ok(m.entry(chunk)),
                Zap::Fat(_) => invalid("micro position in a fat ZAP"),
            },
            Loc::Leaf { block, chunk } => {
                if self.leaf.as_ref().map(|(b, _)| *b) != Some(block) {
                    let leaf = self.store.zap_leaf(&self.dnode, block)?;
                    self.leaf = Some((block, leaf));
                }
                let int_keys = self.int_keys();
                let entry = self.leaf.as_ref().and_then(|(_, leaf)| {
                    leaf.entry_at(chunk, int_keys, ZAP_VALUE_PREVIEW_MAX as usize)
                });
                match entry {
                    Some(e) => Ok(Some(e)),
                    None => invalid(format!(
                        "ZAP {} leaf {} chunk {} does not decode",
                        self.object, block, chunk
                    )),
                }
            }
        }
    }

    pub fn advance(&mut self) {
        if self.idx < self.positions.len() {
            self.idx += 1;
        }
    }

    pub fn at_end(&self) -> bool {
        self.idx >= self.positions.len()
    }

    /// Token for the current position, `None` once every entry has been visited
    pub fn serialize(&self) -> Option<u64> {
        let pos = self.positions.get(self.idx)?;
        let maxcd = zap_maxcd(self.hashbits());
        Some(pos.hash | (pos.cd as u64 & (maxcd - 1)))
    }

    /// Up to `limit` entries from the current position, and the token to continue from
    pub fn take_page(&mut self, limit: u64) -> Result<(Vec<ZapEntry>, Option<u64>), ZfsError> {
        let mut out = Vec::with_capacity(limit.min(1024) as usize);
        while (out.len() as u64) < limit {
            match self.retrieve()? {
                Some(entry) => out.push(entry),
                None => break,
            }
            self.advance();
        }
        Ok((out, self.serialize()))
    }
}

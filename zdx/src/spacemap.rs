//!
//! Space map decoding: the allocate/free log of one region of a vdev
//!
//! A map is an append-only array of 64-bit words in the object's data. One-word entries hold
//! a short range, two-word entries a long range plus its vdev, and debug words carry the txg
//! and sync pass that the following entries were written in.
//!
use std::collections::BTreeMap;
use std::ops::ControlFlow;

use nom::{number::complete as number, IResult};
use tracing::{debug, trace};

use crate::catalog::{type_name, DMU_OT_SPACE_MAP};
use crate::dmu::DNodePhys;
use crate::store::{le_words, ObjectStore};
use crate::{invalid, precondition, type_mismatch, ZfsError};

/// Bonus size of the original space map header, before the histogram was added
pub const SPACE_MAP_SIZE_V0: usize = 3 * 8;
pub const SPACE_MAP_HISTOGRAM_SIZE: usize = 32;
/// Ranges are stored in units of the minimum block size
pub const SPA_MINBLOCKSHIFT: u8 = 9;

const SM2_PREFIX: u64 = 0b11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceMapPhys {
    pub object: u64,
    /// Bytes of map data
    pub length: u64,
    pub alloc: i64,
    /// Present on maps written with the histogram feature
    pub histogram: Option<Vec<u64>>,
}

impl SpaceMapPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (object, length, alloc)) =
            nom::sequence::tuple((number::le_u64, number::le_u64, number::le_i64))(input)?;
        let (input, histogram) = nom::combinator::opt(nom::sequence::preceded(
            nom::bytes::complete::take(5 * 8usize),
            nom::multi::count(number::le_u64, SPACE_MAP_HISTOGRAM_SIZE),
        ))(input)?;
        Ok((
            input,
            Self {
                object,
                length,
                alloc,
                histogram,
            },
        ))
    }
}

/// How raw entry offsets and runs scale into byte addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub start: u64,
    pub size: u64,
    pub shift: u8,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            start: 0,
            size: u64::MAX,
            shift: SPA_MINBLOCKSHIFT,
        }
    }
}

/// `raw << shift`, saturating instead of dropping high bits
fn scale(raw: u64, shift: u8) -> u64 {
    if shift >= 64 || raw > u64::MAX >> shift {
        if raw == 0 {
            0
        } else {
            u64::MAX
        }
    } else {
        raw << shift
    }
}

impl Geometry {
    fn offset(&self, raw: u64) -> u64 {
        self.start.saturating_add(scale(raw, self.shift))
    }
    fn run(&self, raw: u64) -> u64 {
        scale(raw, self.shift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmOp {
    Alloc,
    Free,
}

impl SmOp {
    pub fn as_str(self) -> &'static str {
        match self {
            SmOp::Alloc => "alloc",
            SmOp::Free => "free",
        }
    }
    fn from_bit(bit: u64) -> Self {
        if bit == 0 {
            SmOp::Alloc
        } else {
            SmOp::Free
        }
    }
}

/// One decoded range, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMapEntry {
    pub op: SmOp,
    pub offset: u64,
    pub length: u64,
    /// 0 when no debug word preceded the entry
    pub txg: u64,
    pub sync_pass: u64,
    /// Only two-word entries name their vdev
    pub vdev: Option<u32>,
}

/// One 64-bit word of a map, before scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmWord {
    Debug { action: u64, sync_pass: u64, txg: u64 },
    Single { op: SmOp, offset: u64, run: u64 },
    /// First word of a two-word entry; the second holds the op and offset
    DoubleHead { run: u64, vdev: u32 },
}

fn bits(word: u64, shift: u32, len: u32) -> u64 {
    (word >> shift) & ((1u64 << len) - 1)
}

impl SmWord {
    pub fn decode(word: u64) -> Self {
        if word >> 63 == 0 {
            return SmWord::Single {
                op: SmOp::from_bit(bits(word, 15, 1)),
                offset: bits(word, 16, 47),
                run: bits(word, 0, 15) + 1,
            };
        }
        match word >> 62 {
            SM2_PREFIX => SmWord::DoubleHead {
                run: bits(word, 24, 36) + 1,
                vdev: bits(word, 0, 24) as u32,
            },
            _ => SmWord::Debug {
                action: bits(word, 60, 2),
                sync_pass: bits(word, 50, 10),
                txg: bits(word, 0, 50),
            },
        }
    }
}

/// A space map object opened for reading
pub struct SpaceMap<'s, 'a> {
    store: &'s ObjectStore<'a>,
    object: u64,
    dnode: DNodePhys,
    phys: SpaceMapPhys,
    geometry: Geometry,
}

impl<'s, 'a> SpaceMap<'s, 'a> {
    pub fn open(store: &'s ObjectStore<'a>, object: u64) -> Result<Self, ZfsError> {
        if object == 0 {
            return precondition("space map object id must be non-zero");
        }
        let dnode = store.get_object(object)?;
        if dnode.kind() != DMU_OT_SPACE_MAP {
            return type_mismatch(format!(
                "object {} is type \"{}\" ({}); expected \"space map\"",
                object,
                type_name(dnode.kind()),
                dnode.kind()
            ));
        }
        if dnode.bonus.len() < SPACE_MAP_SIZE_V0 {
            return invalid(format!(
                "object {} bonus is too small for space map payload (bonus={}, need>={})",
                object,
                dnode.bonus.len(),
                SPACE_MAP_SIZE_V0
            ));
        }
        let (_, phys) = SpaceMapPhys::parse(&dnode.bonus)?;
        Ok(Self {
            store,
            object,
            dnode,
            phys,
            geometry: Geometry::default(),
        })
    }

    pub fn object(&self) -> u64 {
        self.object
    }
    pub fn phys(&self) -> &SpaceMapPhys {
        &self.phys
    }
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Decode entries in on-disk order, handing each to `visit` until it breaks. Returns
    /// whether the walk was stopped early.
    pub fn iterate<F>(&self, mut visit: F) -> Result<bool, ZfsError>
    where
        F: FnMut(&SpaceMapEntry) -> ControlFlow<()>,
    {
        let block_size = self.dnode.data_block_size();
        if block_size == 0 || block_size % 8 != 0 {
            return invalid("space map block size is not a whole number of words");
        }
        let length = self.phys.length.min(self.dnode.max_offset());
        if length < self.phys.length {
            debug!(
                object = self.object,
                length = self.phys.length,
                "space map length beyond its last block"
            );
        }
        let mut txg = 0;
        let mut sync_pass = 0;
        let mut head: Option<(u64, u32)> = None;
        let mut pos = 0u64;
        while pos < length {
            let block_id = pos / block_size;
            let block = self.store.read_block(&self.dnode, block_id)?;
            let end = (length - pos).min(block_size) as usize;
            let words = le_words(&block[..end.min(block.len())])?.1;
            for word in words {
                if let Some((run, vdev)) = head.take() {
                    let entry = SpaceMapEntry {
                        op: SmOp::from_bit(word >> 63),
                        offset: self.geometry.offset(word & ((1 << 63) - 1)),
                        length: self.geometry.run(run),
                        txg,
                        sync_pass,
                        vdev: Some(vdev),
                    };
                    if visit(&entry).is_break() {
                        return Ok(true);
                    }
                    continue;
                }
                match SmWord::decode(word) {
                    SmWord::Debug {
                        txg: t,
                        sync_pass: p,
                        ..
                    } => {
                        // padding words carry no txg
                        if t != 0 {
                            txg = t;
                            sync_pass = p;
                        }
                    }
                    SmWord::DoubleHead { run, vdev } => head = Some((run, vdev)),
                    SmWord::Single { op, offset, run } => {
                        let entry = SpaceMapEntry {
                            op,
                            offset: self.geometry.offset(offset),
                            length: self.geometry.run(run),
                            txg,
                            sync_pass,
                            vdev: None,
                        };
                        if visit(&entry).is_break() {
                            return Ok(true);
                        }
                    }
                }
            }
            pos = pos.saturating_add(block_size);
        }
        if head.is_some() {
            return invalid("space map ends inside a two-word entry");
        }
        trace!(object = self.object, "space map walked");
        Ok(false)
    }

    pub fn summary(&self) -> Result<SpaceMapSummary, ZfsError> {
        let mut summary = SpaceMapSummary::default();
        self.iterate(|e| {
            summary.add(e);
            ControlFlow::Continue(())
        })?;
        Ok(summary)
    }

    /// Entries passing `filter`, skipping the first `cursor` matches
    pub fn ranges(
        &self,
        filter: &RangeFilter,
        cursor: u64,
        limit: u64,
    ) -> Result<RangesPage, ZfsError> {
        let mut page = RangesPage::default();
        let mut seen = 0u64;
        self.iterate(|e| {
            if !filter.matches(e) {
                return ControlFlow::Continue(());
            }
            if seen < cursor {
                seen += 1;
                return ControlFlow::Continue(());
            }
            if page.entries.len() as u64 >= limit {
                page.next = Some(cursor + page.entries.len() as u64);
                return ControlFlow::Break(());
            }
            page.entries.push((seen, *e));
            seen += 1;
            ControlFlow::Continue(())
        })?;
        Ok(page)
    }

    /// Matching entries totalled into fixed-size bins by start offset. Only bins that saw
    /// an entry are reported; `cursor` counts those bins.
    pub fn bins(
        &self,
        filter: &RangeFilter,
        bin_size: u64,
        cursor: u64,
        limit: u64,
    ) -> Result<BinsPage, ZfsError> {
        if bin_size == 0 {
            return precondition("bin size must be non-zero");
        }
        let start = self.geometry.start;
        let mut bins: BTreeMap<u64, SpaceBin> = BTreeMap::new();
        self.iterate(|e| {
            if filter.matches(e) {
                let index = e.offset.saturating_sub(start) / bin_size;
                bins.entry(index)
                    .or_insert_with(|| SpaceBin {
                        index,
                        offset: start.saturating_add(index.saturating_mul(bin_size)),
                        ..SpaceBin::default()
                    })
                    .add(e);
            }
            ControlFlow::Continue(())
        })?;
        let total = bins.len() as u64;
        let entries: Vec<SpaceBin> = bins
            .into_iter()
            .map(|(_, b)| b)
            .skip(cursor.min(usize::MAX as u64) as usize)
            .take(limit.min(usize::MAX as u64) as usize)
            .collect();
        let reached = cursor.saturating_add(entries.len() as u64);
        Ok(BinsPage {
            next: if reached < total { Some(reached) } else { None },
            bins: entries,
        })
    }
}

/// `floor(log2(run))`, with 0 for an empty run
pub fn log2_bucket(run: u64) -> usize {
    if run == 0 {
        0
    } else {
        63 - run.leading_zeros() as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceMapSummary {
    pub range_entries: u64,
    pub alloc_entries: u64,
    pub free_entries: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub txg_min: Option<u64>,
    pub txg_max: Option<u64>,
    pub alloc_hist: [u64; 64],
    pub free_hist: [u64; 64],
}

impl Default for SpaceMapSummary {
    fn default() -> Self {
        Self {
            range_entries: 0,
            alloc_entries: 0,
            free_entries: 0,
            alloc_bytes: 0,
            free_bytes: 0,
            txg_min: None,
            txg_max: None,
            alloc_hist: [0; 64],
            free_hist: [0; 64],
        }
    }
}

impl SpaceMapSummary {
    /// Entries are counted as they come; overlapping or repeated ranges are not merged
    pub fn add(&mut self, e: &SpaceMapEntry) {
        let bucket = log2_bucket(e.length);
        self.range_entries += 1;
        match e.op {
            SmOp::Alloc => {
                self.alloc_entries += 1;
                self.alloc_bytes = self.alloc_bytes.saturating_add(e.length);
                self.alloc_hist[bucket] += 1;
            }
            SmOp::Free => {
                self.free_entries += 1;
                self.free_bytes = self.free_bytes.saturating_add(e.length);
                self.free_hist[bucket] += 1;
            }
        }
        if e.txg != 0 {
            self.txg_min = Some(self.txg_min.map_or(e.txg, |t| t.min(e.txg)));
            self.txg_max = Some(self.txg_max.map_or(e.txg, |t| t.max(e.txg)));
        }
    }

    pub fn net_bytes(&self) -> i64 {
        (self.alloc_bytes as i64).wrapping_sub(self.free_bytes as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFilter {
    All,
    Alloc,
    Free,
}

impl OpFilter {
    pub fn parse(s: &str) -> Result<Self, ZfsError> {
        match s {
            "" | "all" | "any" => Ok(OpFilter::All),
            "alloc" => Ok(OpFilter::Alloc),
            "free" => Ok(OpFilter::Free),
            other => precondition(format!("invalid space map op filter {:?}", other)),
        }
    }
    pub fn as_str(self) -> &'static str {
        match self {
            OpFilter::All => "all",
            OpFilter::Alloc => "alloc",
            OpFilter::Free => "free",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFilter {
    pub op: OpFilter,
    pub min_length: u64,
    pub txg_min: Option<u64>,
    pub txg_max: Option<u64>,
}

impl Default for RangeFilter {
    fn default() -> Self {
        Self {
            op: OpFilter::All,
            min_length: 0,
            txg_min: None,
            txg_max: None,
        }
    }
}

impl RangeFilter {
    /// A txg bound of 0 means unbounded
    pub fn new(op: OpFilter, min_length: u64, txg_min: u64, txg_max: u64) -> Result<Self, ZfsError> {
        if txg_min != 0 && txg_max != 0 && txg_min > txg_max {
            return precondition(format!(
                "txg_min ({}) must be <= txg_max ({})",
                txg_min, txg_max
            ));
        }
        Ok(Self {
            op,
            min_length,
            txg_min: Some(txg_min).filter(|t| *t != 0),
            txg_max: Some(txg_max).filter(|t| *t != 0),
        })
    }

    /// With a txg bound set, entries of unknown txg never match
    pub fn matches(&self, e: &SpaceMapEntry) -> bool {
        match (self.op, e.op) {
            (OpFilter::Alloc, SmOp::Free) | (OpFilter::Free, SmOp::Alloc) => return false,
            _ => {}
        }
        if e.length < self.min_length {
            return false;
        }
        if let Some(min) = self.txg_min {
            if e.txg == 0 || e.txg < min {
                return false;
            }
        }
        if let Some(max) = self.txg_max {
            if e.txg == 0 || e.txg > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangesPage {
    /// `(index among matching entries, entry)`
    pub entries: Vec<(u64, SpaceMapEntry)>,
    pub next: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceBin {
    pub index: u64,
    pub offset: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl SpaceBin {
    fn add(&mut self, e: &SpaceMapEntry) {
        match e.op {
            SmOp::Alloc => {
                self.alloc_count += 1;
                self.alloc_bytes = self.alloc_bytes.saturating_add(e.length);
            }
            SmOp::Free => {
                self.free_count += 1;
                self.free_bytes = self.free_bytes.saturating_add(e.length);
            }
        }
    }
    pub fn net_bytes(&self) -> i64 {
        (self.alloc_bytes as i64).wrapping_sub(self.free_bytes as i64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BinsPage {
    pub bins: Vec<SpaceBin>,
    pub next: Option<u64>,
}

//!
//! Space map views: totals and histograms, filtered range pages, and offset bins
//!
use serde::Serialize;

use crate::limits::{spacemap_bin_size, spacemap_bins_page, spacemap_ranges_page};
use crate::session::PoolSession;
use crate::spacemap::{RangeFilter, SpaceMap};
use crate::ZfsError;

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub bucket: usize,
    pub min_length: u64,
    /// `None` for the last bucket, which has no upper bound
    pub max_length: Option<u64>,
    pub alloc_count: u64,
    pub free_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceMapSummaryView {
    pub object: u64,
    pub start: u64,
    pub size: u64,
    pub shift: u8,
    pub smp_length: u64,
    pub smp_alloc: i64,
    /// The on-disk histogram, on maps that carry one
    pub smp_histogram: Option<Vec<u64>>,
    pub range_entries: u64,
    pub alloc_entries: u64,
    pub free_entries: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub net_bytes: i64,
    pub txg_min: Option<u64>,
    pub txg_max: Option<u64>,
    /// Entry counts by `floor(log2(length))`, empty buckets left out
    pub histogram: Vec<HistogramBucket>,
}

pub fn spacemap_summary(session: &PoolSession, obj: u64) -> Result<SpaceMapSummaryView, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let sm = SpaceMap::open(&store, obj)?;
    let s = sm.summary()?;
    let geometry = sm.geometry();
    let histogram = (0..64)
        .filter(|&b| s.alloc_hist[b] != 0 || s.free_hist[b] != 0)
        .map(|b| HistogramBucket {
            bucket: b,
            min_length: 1u64 << b,
            max_length: if b == 63 { None } else { Some((1u64 << (b + 1)) - 1) },
            alloc_count: s.alloc_hist[b],
            free_count: s.free_hist[b],
        })
        .collect();
    Ok(SpaceMapSummaryView {
        object: obj,
        start: geometry.start,
        size: geometry.size,
        shift: geometry.shift,
        smp_length: sm.phys().length,
        smp_alloc: sm.phys().alloc,
        smp_histogram: sm.phys().histogram.clone(),
        range_entries: s.range_entries,
        alloc_entries: s.alloc_entries,
        free_entries: s.free_entries,
        alloc_bytes: s.alloc_bytes,
        free_bytes: s.free_bytes,
        net_bytes: s.net_bytes(),
        txg_min: s.txg_min,
        txg_max: s.txg_max,
        histogram,
    })
}

/// The filters a page was produced with, echoed back
#[derive(Debug, Clone, Serialize)]
pub struct FilterView {
    pub op: &'static str,
    pub min_length: u64,
    pub txg_min: Option<u64>,
    pub txg_max: Option<u64>,
}

impl From<&RangeFilter> for FilterView {
    fn from(f: &RangeFilter) -> Self {
        Self {
            op: f.op.as_str(),
            min_length: f.min_length,
            txg_min: f.txg_min,
            txg_max: f.txg_max,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeView {
    pub index: u64,
    pub op: &'static str,
    pub offset: u64,
    pub length: u64,
    pub txg: u64,
    pub sync_pass: u64,
    pub vdev: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceMapRanges {
    pub object: u64,
    pub cursor: u64,
    pub limit: u64,
    pub count: u64,
    pub next: Option<u64>,
    pub filters: FilterView,
    pub ranges: Vec<RangeView>,
}

/// Entries matching `filter` in on-disk order. `cursor` counts matching entries.
pub fn spacemap_ranges(
    session: &PoolSession,
    obj: u64,
    filter: &RangeFilter,
    cursor: u64,
    limit: u64,
) -> Result<SpaceMapRanges, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let sm = SpaceMap::open(&store, obj)?;
    let limit = spacemap_ranges_page(limit);
    let page = sm.ranges(filter, cursor, limit)?;
    let ranges: Vec<RangeView> = page
        .entries
        .iter()
        .map(|(index, e)| RangeView {
            index: *index,
            op: e.op.as_str(),
            offset: e.offset,
            length: e.length,
            txg: e.txg,
            sync_pass: e.sync_pass,
            vdev: e.vdev,
        })
        .collect();
    Ok(SpaceMapRanges {
        object: obj,
        cursor,
        limit,
        count: ranges.len() as u64,
        next: page.next,
        filters: filter.into(),
        ranges,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BinView {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub net_bytes: i64,
    pub alloc_count: u64,
    pub free_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceMapBins {
    pub object: u64,
    pub bin_size: u64,
    pub cursor: u64,
    pub limit: u64,
    pub count: u64,
    pub next: Option<u64>,
    pub filters: FilterView,
    pub bins: Vec<BinView>,
}

/// Matching entries totalled into `bin_size` byte bins by start offset
pub fn spacemap_bins(
    session: &PoolSession,
    obj: u64,
    filter: &RangeFilter,
    bin_size: u64,
    cursor: u64,
    limit: u64,
) -> Result<SpaceMapBins, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let sm = SpaceMap::open(&store, obj)?;
    let bin_size = spacemap_bin_size(bin_size);
    let limit = spacemap_bins_page(limit);
    let page = sm.bins(filter, bin_size, cursor, limit)?;
    let bins: Vec<BinView> = page
        .bins
        .iter()
        .map(|b| BinView {
            index: b.index,
            offset: b.offset,
            size: bin_size,
            alloc_bytes: b.alloc_bytes,
            free_bytes: b.free_bytes,
            net_bytes: b.net_bytes(),
            alloc_count: b.alloc_count,
            free_count: b.free_count,
        })
        .collect();
    Ok(SpaceMapBins {
        object: obj,
        bin_size,
        cursor,
        limit,
        count: bins.len() as u64,
        next: page.next,
        filters: filter.into(),
        bins,
    })
}

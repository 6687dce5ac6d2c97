//!
//! Per-request caps and defaults shared by every view
//!

pub const OBJECT_PAGE_DEFAULT: u64 = 200;
pub const OBJECT_PAGE_MAX: u64 = 10_000;

pub const ZAP_PAGE_DEFAULT: u64 = 200;
pub const ZAP_PAGE_MAX: u64 = 10_000;
/// ZAP values larger than this are reported as truncated instead of decoded
pub const ZAP_VALUE_PREVIEW_MAX: u64 = 1 << 20;
/// Values shown in a numeric preview before eliding the rest
pub const ZAP_NUMBERS_PREVIEW: usize = 8;

pub const SPACEMAP_RANGES_DEFAULT: u64 = 200;
pub const SPACEMAP_RANGES_MAX: u64 = 2_000;
pub const SPACEMAP_BINS_DEFAULT: u64 = 256;
pub const SPACEMAP_BINS_MAX: u64 = 2_048;
pub const SPACEMAP_BIN_SIZE_DEFAULT: u64 = 1 << 20;
pub const SPACEMAP_BIN_SIZE_MIN: u64 = 512;
pub const SPACEMAP_BIN_SIZE_MAX: u64 = 4 << 30;

pub const BLOCK_TREE_DEPTH_DEFAULT: u64 = 4;
pub const BLOCK_TREE_DEPTH_MAX: u64 = 16;
pub const BLOCK_TREE_NODES_DEFAULT: u64 = 2_000;
pub const BLOCK_TREE_NODES_MAX: u64 = 50_000;

pub const DSL_TREE_DEPTH_DEFAULT: u64 = 4;
pub const DSL_TREE_DEPTH_MAX: u64 = 16;
pub const DSL_TREE_NODES_DEFAULT: u64 = 500;
pub const DSL_TREE_NODES_MAX: u64 = 10_000;

pub const ERRLOG_PAGE_DEFAULT: u64 = 200;
pub const ERRLOG_PAGE_MAX: u64 = 5_000;

pub const LINEAGE_DEFAULT: u64 = 64;
/// Applied regardless of what the caller asks for
pub const LINEAGE_CEILING: u64 = 4_096;

pub const DATA_READ_DEFAULT: u64 = 64 << 10;
pub const DATA_READ_MAX: u64 = 1 << 20;

pub const RAW_READ_MAX: u64 = 1 << 20;

/// Zero selects `default`, anything else is clamped into `min..=max`.
pub fn clamp_or_default(value: u64, default: u64, min: u64, max: u64) -> u64 {
    if value == 0 {
        default
    } else {
        value.max(min).min(max)
    }
}

pub fn object_page(limit: u64) -> u64 {
    clamp_or_default(limit, OBJECT_PAGE_DEFAULT, 1, OBJECT_PAGE_MAX)
}

pub fn zap_page(limit: u64) -> u64 {
    clamp_or_default(limit, ZAP_PAGE_DEFAULT, 1, ZAP_PAGE_MAX)
}

pub fn spacemap_ranges_page(limit: u64) -> u64 {
    clamp_or_default(limit, SPACEMAP_RANGES_DEFAULT, 1, SPACEMAP_RANGES_MAX)
}

pub fn spacemap_bins_page(limit: u64) -> u64 {
    clamp_or_default(limit, SPACEMAP_BINS_DEFAULT, 1, SPACEMAP_BINS_MAX)
}

pub fn spacemap_bin_size(size: u64) -> u64 {
    clamp_or_default(
        size,
        SPACEMAP_BIN_SIZE_DEFAULT,
        SPACEMAP_BIN_SIZE_MIN,
        SPACEMAP_BIN_SIZE_MAX,
    )
}

pub fn block_tree_depth(depth: u64) -> u64 {
    clamp_or_default(depth, BLOCK_TREE_DEPTH_DEFAULT, 1, BLOCK_TREE_DEPTH_MAX)
}

pub fn block_tree_nodes(nodes: u64) -> u64 {
    clamp_or_default(nodes, BLOCK_TREE_NODES_DEFAULT, 1, BLOCK_TREE_NODES_MAX)
}

pub fn dsl_tree_depth(depth: u64) -> u64 {
    clamp_or_default(depth, DSL_TREE_DEPTH_DEFAULT, 1, DSL_TREE_DEPTH_MAX)
}

pub fn dsl_tree_nodes(nodes: u64) -> u64 {
    clamp_or_default(nodes, DSL_TREE_NODES_DEFAULT, 1, DSL_TREE_NODES_MAX)
}

pub fn errlog_page(limit: u64) -> u64 {
    clamp_or_default(limit, ERRLOG_PAGE_DEFAULT, 1, ERRLOG_PAGE_MAX)
}

pub fn lineage_steps(steps: u64) -> u64 {
    clamp_or_default(steps, LINEAGE_DEFAULT, 1, LINEAGE_CEILING)
}

pub fn data_read(len: u64) -> u64 {
    clamp_or_default(len, DATA_READ_DEFAULT, 1, DATA_READ_MAX)
}

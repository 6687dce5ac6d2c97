//!
//! Pool level views: the label config, the active uberblock, raw block reads, the persistent
//! error logs and the type catalog
//!
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::catalog::{list_types, DmuTypeEntry};
use crate::errlog::{approx_entries, errlog_objects, list_errors, ErrlogSource};
use crate::limits::{errlog_page, RAW_READ_MAX};
use crate::session::PoolSession;
use crate::view::BlkptrFields;
use crate::{hex_string, precondition, ZfsError};

#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub guid: u64,
    pub state: u64,
    pub txg: u64,
    pub version: u64,
    pub hostid: u64,
    pub hostname: Option<String>,
    pub errata: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UberblockView {
    pub txg: u64,
    pub timestamp: u64,
    pub version: u64,
    pub guid_sum: u64,
    pub rootbp: BlkptrFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub pool: PoolInfo,
    /// Feature names the pool needs to be read at all
    pub features_for_read: Vec<String>,
    pub vdev_tree: Value,
    pub uberblock: UberblockView,
}

pub fn pool_summary(session: &PoolSession) -> PoolSummary {
    let _guard = session.read_guard();
    let config = session.config();
    let ub = session.uberblock();
    let pool = PoolInfo {
        name: config
            .get_str("name")
            .unwrap_or_else(|| session.name())
            .to_string(),
        guid: config.get_u64("pool_guid").unwrap_or(0),
        state: config.get_u64("state").unwrap_or(0),
        txg: config.get_u64("txg").unwrap_or(0),
        version: config.get_u64("version").unwrap_or(0),
        hostid: config.get_u64("hostid").unwrap_or(0),
        hostname: config.get_str("hostname").map(str::to_string),
        errata: config.get_u64("errata").unwrap_or(0),
    };
    let features_for_read = config
        .get_nvlist("features_for_read")
        .map(|f| f.names().map(str::to_string).collect())
        .unwrap_or_default();
    PoolSummary {
        pool,
        features_for_read,
        vdev_tree: config
            .get_nvlist("vdev_tree")
            .map_or(Value::Null, |t| t.to_json()),
        uberblock: UberblockView {
            txg: ub.txg,
            timestamp: ub.timestamp,
            version: ub.version,
            guid_sum: ub.guid_sum,
            rootbp: (&ub.rootbp).into(),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolVdevs {
    pub name: String,
    pub vdev_tree: Value,
}

pub fn pool_vdevs(session: &PoolSession) -> PoolVdevs {
    let _guard = session.read_guard();
    PoolVdevs {
        name: session.name().to_string(),
        vdev_tree: session
            .config()
            .get_nvlist("vdev_tree")
            .map_or(Value::Null, |t| t.to_json()),
    }
}

pub fn dmu_types() -> Vec<DmuTypeEntry> {
    list_types()
}

#[derive(Debug, Clone, Serialize)]
pub struct RawBlock {
    pub vdev: u64,
    pub offset: u64,
    pub size: u64,
    pub data_hex: String,
}

/// `size` raw bytes at `offset` in the allocatable area of top-level vdev `vdev`
pub fn read_block(
    session: &PoolSession,
    vdev: u64,
    offset: u64,
    size: u64,
) -> Result<RawBlock, ZfsError> {
    if size == 0 || size > RAW_READ_MAX {
        return precondition(format!(
            "size must be between 1 and {} bytes, got {}",
            RAW_READ_MAX, size
        ));
    }
    let _guard = session.read_guard();
    if !session.reader().has_vdev(vdev) {
        return precondition(format!("pool has no top-level vdev {}", vdev));
    }
    debug!(vdev, offset, size, "raw read");
    let data = session.reader().read_raw(vdev, offset, size)?;
    Ok(RawBlock {
        vdev,
        offset,
        size: data.len() as u64,
        data_hex: hex_string(&data),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolErrorEntry {
    pub source: ErrlogSource,
    pub dataset_obj: u64,
    pub object: u64,
    pub level: i64,
    pub blkid: u64,
    pub birth: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolErrors {
    pub pool: String,
    /// As recorded in the label config
    pub error_count: u64,
    pub approx_entries: u64,
    pub head_errlog: bool,
    pub errlog_last_obj: u64,
    pub errlog_scrub_obj: u64,
    pub cursor: u64,
    pub limit: u64,
    pub count: u64,
    pub next: Option<u64>,
    pub entries: Vec<PoolErrorEntry>,
}

/// A page of the persistent error logs. Records are bookmarks only; no paths are resolved.
pub fn pool_errors(session: &PoolSession, cursor: u64, limit: u64) -> Result<PoolErrors, ZfsError> {
    let limit = errlog_page(limit);
    let _guard = session.read_guard();
    let store = session.mos_store();
    let logs = errlog_objects(&store)?;
    let page = list_errors(&store, &logs, cursor, limit)?;
    let entries: Vec<PoolErrorEntry> = page
        .entries
        .into_iter()
        .map(|r| PoolErrorEntry {
            source: r.source,
            dataset_obj: r.dataset_obj,
            object: r.object,
            level: r.level,
            blkid: r.blkid,
            birth: r.birth,
        })
        .collect();
    Ok(PoolErrors {
        pool: session.name().to_string(),
        error_count: session.config().get_u64("error_count").unwrap_or(0),
        approx_entries: approx_entries(&store, &logs),
        head_errlog: logs.head_errlog,
        errlog_last_obj: logs.last,
        errlog_scrub_obj: logs.scrub,
        cursor,
        limit,
        count: entries.len() as u64,
        next: page.next,
        entries,
    })
}

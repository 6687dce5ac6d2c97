//!
//! Persistent error logs: bookmarks of blocks that failed to read, kept in MOS ZAPs
//!
//! Without `head_errlog` each log is one ZAP named `dsobj:object:level:blkid`. With it the log
//! maps each head dataset (its id in hex) to a ZAP of `object:level:blkid:birth` names. All
//! fields are lowercase hex.
//!
use serde::Serialize;
use tracing::{debug, trace};

use crate::store::ObjectStore;
use crate::zap::ZapKey;
use crate::zap_cursor::ZapCursor;
use crate::ZfsError;

const OBJECT_DIRECTORY_OBJ: u64 = 1;
pub const ERRLOG_SCRUB: &str = "errlog_scrub";
pub const ERRLOG_LAST: &str = "errlog_last";
pub const FEATURES_FOR_WRITE: &str = "features_for_write";
pub const HEAD_ERRLOG_FEATURE: &str = "com.delphix:head_errlog";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrlogSource {
    Scrub,
    Last,
}

impl ErrlogSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrlogSource::Scrub => "scrub",
            ErrlogSource::Last => "last",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub source: ErrlogSource,
    pub dataset_obj: u64,
    pub object: u64,
    pub level: i64,
    pub blkid: u64,
    /// Only the per-dataset logs record a birth txg
    pub birth: Option<u64>,
}

/// Strict lowercase or uppercase hex, no sign, no prefix
fn parse_hex(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

fn hex_fields(name: &str) -> Option<[u64; 4]> {
    let mut out = [0u64; 4];
    let mut parts = name.split(':');
    for slot in out.iter_mut() {
        *slot = parse_hex(parts.next()?)?;
    }
    match parts.next() {
        Some(_) => None,
        None => Some(out),
    }
}

/// `dsobj:object:level:blkid`
pub fn parse_bookmark(name: &str) -> Option<(u64, u64, i64, u64)> {
    let [ds, obj, level, blkid] = hex_fields(name)?;
    Some((ds, obj, level as i64, blkid))
}

/// `object:level:blkid:birth`
pub fn parse_err_phys(name: &str) -> Option<(u64, i64, u64, u64)> {
    let [obj, level, blkid, birth] = hex_fields(name)?;
    Some((obj, level as i64, blkid, birth))
}

fn key_str(key: &ZapKey) -> Option<&str> {
    match key {
        ZapKey::Str(s) => std::str::from_utf8(s).ok(),
        ZapKey::Ints(_) => None,
    }
}

/// Where the logs live, from the MOS object directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrlogObjects {
    pub scrub: u64,
    pub last: u64,
    pub head_errlog: bool,
}

pub fn errlog_objects(store: &ObjectStore<'_>) -> Result<ErrlogObjects, ZfsError> {
    let objdir = store.get_object(OBJECT_DIRECTORY_OBJ)?;
    let scrub = store.zap_lookup_u64(&objdir, ERRLOG_SCRUB)?.unwrap_or(0);
    let last = store.zap_lookup_u64(&objdir, ERRLOG_LAST)?.unwrap_or(0);
    let head_errlog = match store.zap_lookup_u64(&objdir, FEATURES_FOR_WRITE)? {
        Some(obj) => {
            let features = store.get_object(obj)?;
            store.zap_lookup(&features, HEAD_ERRLOG_FEATURE)?.is_some()
        }
        None => false,
    };
    Ok(ErrlogObjects {
        scrub,
        last,
        head_errlog,
    })
}

#[derive(Debug, Clone)]
pub struct ErrlogPage {
    pub entries: Vec<ErrorRecord>,
    pub next: Option<u64>,
}

struct Pager {
    cursor: u64,
    limit: u64,
    seen: u64,
    entries: Vec<ErrorRecord>,
    more: bool,
}

impl Pager {
    /// False once the page is full
    fn push(&mut self, rec: ErrorRecord) -> bool {
        if self.seen < self.cursor {
            self.seen += 1;
            return true;
        }
        if self.entries.len() as u64 >= self.limit {
            self.more = true;
            return false;
        }
        self.entries.push(rec);
        self.seen += 1;
        true
    }
}

fn scan_legacy(
    store: &ObjectStore<'_>,
    obj: u64,
    source: ErrlogSource,
    pager: &mut Pager,
) -> Result<bool, ZfsError> {
    let mut zc = ZapCursor::init(store, obj)?;
    while let Some(e) = zc.retrieve()? {
        match key_str(&e.key).and_then(parse_bookmark) {
            Some((dataset_obj, object, level, blkid)) => {
                let rec = ErrorRecord {
                    source,
                    dataset_obj,
                    object,
                    level,
                    blkid,
                    birth: None,
                };
                if !pager.push(rec) {
                    return Ok(false);
                }
            }
            None => trace!(obj, name = %e.name(), "not a bookmark"),
        }
        zc.advance();
    }
    Ok(true)
}

fn scan_head(
    store: &ObjectStore<'_>,
    obj: u64,
    source: ErrlogSource,
    pager: &mut Pager,
) -> Result<bool, ZfsError> {
    let mut top = ZapCursor::init(store, obj)?;
    while let Some(e) = top.retrieve()? {
        top.advance();
        let dataset_obj = match key_str(&e.key).and_then(parse_hex) {
            Some(ds) => ds,
            None => continue,
        };
        let child_obj = match e.single_u64() {
            Some(c) if c != 0 => c,
            _ => continue,
        };
        let mut child = match ZapCursor::init(store, child_obj) {
            Ok(c) => c,
            Err(err) => {
                debug!(obj, dataset_obj, child_obj, error = %err, "dataset error log skipped");
                continue;
            }
        };
        while let Some(c) = child.retrieve()? {
            child.advance();
            if let Some((object, level, blkid, birth)) = key_str(&c.key).and_then(parse_err_phys)
            {
                let rec = ErrorRecord {
                    source,
                    dataset_obj,
                    object,
                    level,
                    blkid,
                    birth: Some(birth),
                };
                if !pager.push(rec) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// One page of error records, the scrub log first. `cursor` counts records.
pub fn list_errors(
    store: &ObjectStore<'_>,
    logs: &ErrlogObjects,
    cursor: u64,
    limit: u64,
) -> Result<ErrlogPage, ZfsError> {
    let mut pager = Pager {
        cursor,
        limit,
        seen: 0,
        entries: vec![],
        more: false,
    };
    for (obj, source) in &[(logs.scrub, ErrlogSource::Scrub), (logs.last, ErrlogSource::Last)] {
        if *obj == 0 {
            continue;
        }
        let go_on = if logs.head_errlog {
            scan_head(store, *obj, *source, &mut pager)?
        } else {
            scan_legacy(store, *obj, *source, &mut pager)?
        };
        if !go_on {
            break;
        }
    }
    let next = if pager.more {
        Some(cursor + pager.entries.len() as u64)
    } else {
        None
    };
    Ok(ErrlogPage {
        entries: pager.entries,
        next,
    })
}

/// Entry count from ZAP headers alone, without decoding names
pub fn approx_entries(store: &ObjectStore<'_>, logs: &ErrlogObjects) -> u64 {
    let mut total = 0u64;
    for obj in &[logs.scrub, logs.last] {
        if *obj == 0 {
            continue;
        }
        let counted = if logs.head_errlog {
            ZapCursor::init(store, *obj).and_then(|mut zc| {
                let mut sum = 0u64;
                while let Some(e) = zc.retrieve()? {
                    zc.advance();
                    if let Some(child) = e.single_u64().filter(|c| *c != 0) {
                        sum = sum.saturating_add(store.zap_count(child).unwrap_or(0));
                    }
                }
                Ok(sum)
            })
        } else {
            store.zap_count(*obj)
        };
        match counted {
            Ok(n) => total = total.saturating_add(n),
            Err(err) => debug!(obj, error = %err, "error log not counted"),
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DMU_OT_ERROR_LOG, DMU_OT_ZAP_OTHER};
    use crate::testutil::PoolBuilder;

    fn named(names: &[&str]) -> Vec<(ZapKey, u8, Vec<u8>)> {
        names
            .iter()
            .map(|n| (ZapKey::Str(n.as_bytes().to_vec()), 1u8, b"\0".to_vec()))
            .collect()
    }

    #[test]
    fn keys_are_strict_hex() {
        assert_eq!(parse_bookmark("36:1a:0:ff"), Some((0x36, 0x1a, 0, 0xff)));
        assert_eq!(parse_err_phys("1eec33d:0:2:64"), Some((0x1eec33d, 0, 2, 0x64)));
        assert_eq!(parse_hex("1eec33d"), Some(0x1eec33d));
        assert_eq!(parse_bookmark("36:1a:0"), None);
        assert_eq!(parse_bookmark("36:1a:0:ff:1"), None);
        assert_eq!(parse_bookmark("36:+1a:0:ff"), None);
        assert_eq!(parse_bookmark("36::0:ff"), None);
        assert_eq!(parse_hex("12g"), None);
        assert_eq!(parse_hex(""), None);
    }

    #[test]
    fn legacy_logs_page_across_both_objects() {
        let mut pool = PoolBuilder::new();
        let scrub = pool.mos_fatzap(DMU_OT_ERROR_LOG, &named(&["36:1a:0:0", "36:1b:1:4"]), 0);
        let last = pool.mos_fatzap(DMU_OT_ERROR_LOG, &named(&["40:2:0:9", "garbage"]), 0);
        pool.mos_object_directory(&[(ERRLOG_SCRUB, scrub), (ERRLOG_LAST, last)]);
        let session = pool.session();
        let store = session.mos_store();
        let logs = errlog_objects(&store).expect("objects");
        assert!(!logs.head_errlog);
        assert_eq!(approx_entries(&store, &logs), 4);

        let all = list_errors(&store, &logs, 0, 10).expect("page");
        assert_eq!(all.next, None);
        assert_eq!(all.entries.len(), 3);
        assert_eq!(all.entries[2].source, ErrlogSource::Last);
        assert_eq!(all.entries[2].dataset_obj, 0x40);
        assert!(all.entries.iter().all(|e| e.birth.is_none()));

        let first = list_errors(&store, &logs, 0, 2).expect("page");
        assert_eq!(first.next, Some(2));
        let rest = list_errors(&store, &logs, 2, 2).expect("page");
        assert_eq!(rest.next, None);
        assert_eq!(rest.entries, all.entries[2..].to_vec());
    }

    #[test]
    fn head_logs_nest_per_dataset() {
        let mut pool = PoolBuilder::new();
        let features = pool.mos_microzap(DMU_OT_ZAP_OTHER, &[(HEAD_ERRLOG_FEATURE, 1)]);
        let ds_log = pool.mos_fatzap(DMU_OT_ERROR_LOG, &named(&["1a:0:0:64", "1b:1:3:65"]), 0);
        let scrub = pool.mos_microzap(DMU_OT_ERROR_LOG, &[("1eec33d", ds_log), ("zz", ds_log)]);
        pool.mos_object_directory(&[(ERRLOG_SCRUB, scrub), (FEATURES_FOR_WRITE, features)]);
        let session = pool.session();
        let store = session.mos_store();
        let logs = errlog_objects(&store).expect("objects");
        assert!(logs.head_errlog);
        assert_eq!(logs.last, 0);

        let page = list_errors(&store, &logs, 0, 0x10).expect("page");
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries.iter().all(|e| e.dataset_obj == 0x1eec33d));
        let mut births: Vec<Option<u64>> = page.entries.iter().map(|e| e.birth).collect();
        births.sort();
        assert_eq!(births, vec![Some(0x64), Some(0x65)]);
    }

    #[test]
    fn pools_without_logs_are_empty() {
        let mut pool = PoolBuilder::new();
        pool.mos_object_directory(&[]);
        let session = pool.session();
        let store = session.mos_store();
        let logs = errlog_objects(&store).expect("objects");
        assert_eq!((logs.scrub, logs.last), (0, 0));
        let page = list_errors(&store, &logs, 0, 5).expect("page");
        assert!(page.entries.is_empty());
        assert_eq!(page.next, None);
        assert_eq!(approx_entries(&store, &logs), 0);
    }
}

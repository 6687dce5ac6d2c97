//!
//! Filesystem namespace traversal: path resolution and directory listing
//!
use tracing::trace;

use crate::store::ObjectStore;
use crate::zap_cursor::ZapCursor;
use crate::zpl::{require_zpl, root_object, DirEntry, DT_DIR};
use crate::ZfsError;

/// Why a path stopped resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    NotFound,
    NotDir,
}

impl WalkError {
    pub fn as_str(self) -> &'static str {
        match self {
            WalkError::NotFound => "not_found",
            WalkError::NotDir => "not_dir",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathWalk {
    pub root_obj: u64,
    /// Absolute path of the components consumed so far
    pub resolved: String,
    /// Unconsumed input, starting at the failing component for a lookup failure and after the
    /// non-directory for `NotDir`
    pub remaining: String,
    /// Last object reached and its directory entry type
    pub objid: u64,
    pub kind: u64,
    pub error: Option<WalkError>,
}

impl PathWalk {
    pub fn found(&self) -> bool {
        self.error.is_none()
    }
}

/// Look `name` up in directory `dir`. Any failure to produce a directory entry is a miss.
fn lookup(store: &ObjectStore<'_>, dir: u64, name: &str) -> Option<DirEntry> {
    let dn = store.get_object(dir).ok()?;
    match store.zap_lookup(&dn, name) {
        Ok(Some(entry)) => entry.single_u64().map(DirEntry),
        Ok(None) => None,
        Err(e) => {
            trace!(dir, name, error = %e, "directory lookup failed");
            None
        }
    }
}

/// Resolve a slash separated path from the filesystem root, one component at a time
pub fn walk_path(store: &ObjectStore<'_>, path: &str) -> Result<PathWalk, ZfsError> {
    let root = root_object(store)?;
    let mut walk = PathWalk {
        root_obj: root,
        resolved: String::from("/"),
        remaining: String::new(),
        objid: root,
        kind: DT_DIR,
        error: None,
    };
    let mut rest = path.trim_start_matches('/');
    while !rest.is_empty() {
        let (name, after) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let dirent = match lookup(store, walk.objid, name) {
            Some(d) => d,
            None => {
                walk.error = Some(WalkError::NotFound);
                walk.remaining = rest.to_string();
                return Ok(walk);
            }
        };
        if walk.resolved.len() > 1 {
            walk.resolved.push('/');
        }
        walk.resolved.push_str(name);
        walk.objid = dirent.get_objnum();
        walk.kind = dirent.get_type();
        let next = after.trim_start_matches('/');
        if !next.is_empty() && walk.kind != DT_DIR {
            walk.error = Some(WalkError::NotDir);
            walk.remaining = next.to_string();
            return Ok(walk);
        }
        rest = next;
    }
    Ok(walk)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub name: String,
    pub objid: u64,
    pub kind: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DirPage {
    pub entries: Vec<DirListing>,
    pub next: Option<u64>,
}

/// One page of a ZPL directory, resuming at `cursor` (0 for the start)
pub fn list_dir(
    store: &ObjectStore<'_>,
    dir_obj: u64,
    cursor: u64,
    limit: u64,
) -> Result<DirPage, ZfsError> {
    require_zpl(store)?;
    let mut zc = ZapCursor::init_from_token(store, dir_obj, cursor)?;
    let (entries, next) = zc.take_page(limit)?;
    let entries = entries
        .into_iter()
        .map(|e| {
            let dirent = DirEntry(e.single_u64().unwrap_or(0));
            DirListing {
                name: e.name(),
                objid: dirent.get_objnum(),
                kind: dirent.get_type(),
            }
        })
        .collect();
    Ok(DirPage { entries, next })
}

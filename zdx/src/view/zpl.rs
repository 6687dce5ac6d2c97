//!
//! Filesystem views over one dataset's objset: root, directory pages, path walks, attributes
//! and logical file reads
//!
use serde::Serialize;

use crate::catalog::{type_name, DMU_OT_DIRECTORY_CONTENTS};
use crate::limits::{data_read, zap_page};
use crate::session::{PoolSession, Scope};
use crate::view::Timespec;
use crate::walk::{list_dir, walk_path, WalkError};
use crate::zpl::{dirent_type_name, mode_to_dirent_type, read_attrs, require_zpl, root_object};
use crate::{hex_string, type_mismatch, ZfsError};

#[derive(Debug, Clone, Serialize)]
pub struct ObjsetRoot {
    pub objset_id: u64,
    pub root_obj: u64,
}

pub fn objset_root(session: &PoolSession, dsobj: u64) -> Result<ObjsetRoot, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(Scope::Dataset(dsobj))?;
    Ok(ObjsetRoot {
        objset_id: dsobj,
        root_obj: root_object(&store)?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryView {
    pub name: String,
    pub objid: u64,
    #[serde(rename = "type")]
    pub kind: u64,
    pub type_name: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntries {
    pub objset_id: u64,
    pub dir_obj: u64,
    pub cursor: u64,
    pub limit: u64,
    pub count: u64,
    pub next: Option<u64>,
    pub entries: Vec<DirEntryView>,
}

/// One page of directory `dir_obj`, resuming at `cursor`
pub fn objset_dir_entries(
    session: &PoolSession,
    dsobj: u64,
    dir_obj: u64,
    cursor: u64,
    limit: u64,
) -> Result<DirEntries, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(Scope::Dataset(dsobj))?;
    require_zpl(&store)?;
    let dn = store.get_object(dir_obj)?;
    if dn.kind() != DMU_OT_DIRECTORY_CONTENTS {
        return type_mismatch(format!(
            "object {} is type \"{}\", not a directory",
            dir_obj,
            type_name(dn.kind())
        ));
    }
    let limit = zap_page(limit);
    let page = list_dir(&store, dir_obj, cursor, limit)?;
    let entries: Vec<DirEntryView> = page
        .entries
        .into_iter()
        .map(|e| DirEntryView {
            name: e.name,
            objid: e.objid,
            kind: e.kind,
            type_name: dirent_type_name(e.kind),
        })
        .collect();
    Ok(DirEntries {
        objset_id: dsobj,
        dir_obj,
        cursor,
        limit,
        count: entries.len() as u64,
        next: page.next,
        entries,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkView {
    pub objset_id: u64,
    pub path: String,
    pub root_obj: u64,
    pub resolved: String,
    pub remaining: String,
    pub objid: u64,
    #[serde(rename = "type")]
    pub kind: u64,
    pub type_name: &'static str,
    pub found: bool,
    /// `not_found` or `not_dir`
    pub error: Option<&'static str>,
}

pub fn objset_walk(session: &PoolSession, dsobj: u64, path: &str) -> Result<WalkView, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(Scope::Dataset(dsobj))?;
    let w = walk_path(&store, path)?;
    Ok(WalkView {
        objset_id: dsobj,
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        root_obj: w.root_obj,
        found: w.found(),
        resolved: w.resolved,
        remaining: w.remaining,
        objid: w.objid,
        kind: w.kind,
        type_name: dirent_type_name(w.kind),
        error: w.error.map(WalkError::as_str),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StatView {
    pub objset_id: u64,
    pub objid: u64,
    pub mode: u64,
    #[serde(rename = "type")]
    pub kind: u64,
    pub type_name: &'static str,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub links: u64,
    pub parent: u64,
    pub flags: u64,
    pub gen: u64,
    /// Some attributes sit in a spill block that could not be read
    pub partial: bool,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub crtime: Timespec,
}

pub fn objset_stat(session: &PoolSession, dsobj: u64, objid: u64) -> Result<StatView, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(Scope::Dataset(dsobj))?;
    let a = read_attrs(&store, objid)?;
    let kind = mode_to_dirent_type(a.mode);
    Ok(StatView {
        objset_id: dsobj,
        objid,
        mode: a.mode,
        kind,
        type_name: dirent_type_name(kind),
        uid: a.uid,
        gid: a.gid,
        size: a.size,
        links: a.links,
        parent: a.parent,
        flags: a.flags,
        gen: a.gen,
        partial: a.partial,
        atime: a.atime.into(),
        mtime: a.mtime.into(),
        ctime: a.ctime.into(),
        crtime: a.crtime.into(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DataRead {
    pub objset_id: u64,
    pub id: u64,
    pub offset: u64,
    pub requested: u64,
    pub size: u64,
    pub max_offset: u64,
    pub eof: bool,
    pub data_hex: String,
}

/// Logical bytes of object `id` starting at `offset`. A zero `len` reads the default amount.
pub fn objset_read_data(
    session: &PoolSession,
    dsobj: u64,
    id: u64,
    offset: u64,
    len: u64,
) -> Result<DataRead, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(Scope::Dataset(dsobj))?;
    let dn = store.get_object(id)?;
    let requested = data_read(len);
    let data = store.read_object_data(&dn, offset, requested)?;
    let max_offset = dn.max_offset();
    Ok(DataRead {
        objset_id: dsobj,
        id,
        offset,
        requested,
        size: data.len() as u64,
        max_offset,
        eof: offset.saturating_add(data.len() as u64) >= max_offset,
        data_hex: hex_string(&data),
    })
}

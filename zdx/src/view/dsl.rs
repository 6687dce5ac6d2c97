//!
//! DSL views: the directory hierarchy, head datasets, snapshots and their lineage
//!
use serde::Serialize;
use tracing::debug;

use crate::dsl_tree::{child_dirs, dir_phys, dsl_tree};
use crate::lineage::{walk_lineage, Lineage};
use crate::session::PoolSession;
use crate::store::ObjectStore;
use crate::view::BlkptrFields;
use crate::zap::ZapEntry;
use crate::zap_cursor::ZapCursor;
use crate::{not_found, ZfsError};

const OBJECT_DIRECTORY_OBJ: u64 = 1;
const ROOT_DATASET: &str = "root_dataset";

/// Every entry of a name map, in cursor order
fn map_entries(store: &ObjectStore<'_>, obj: u64) -> Result<Vec<ZapEntry>, ZfsError> {
    let mut zc = ZapCursor::init(store, obj)?;
    let mut out = vec![];
    while let Some(e) = zc.retrieve()? {
        out.push(e);
        zc.advance();
    }
    Ok(out)
}

fn root_dir_obj(store: &ObjectStore<'_>) -> Result<u64, ZfsError> {
    let objdir = store.get_object(OBJECT_DIRECTORY_OBJ)?;
    match store.zap_lookup_u64(&objdir, ROOT_DATASET)? {
        Some(dir) => Ok(dir),
        None => not_found("object directory has no root_dataset entry"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DslChild {
    pub name: String,
    pub dir_objid: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DslChildren {
    pub dir_objid: u64,
    pub child_dir_zapobj: u64,
    pub children: Vec<DslChild>,
}

/// Child directories of DSL directory `dir`. Map entries that do not name a DSL directory
/// are left out.
pub fn dsl_dir_children(session: &PoolSession, dir: u64) -> Result<DslChildren, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let dd = dir_phys(&store, dir)?;
    let children = child_dirs(&store, dir, &dd)?
        .into_iter()
        .map(|c| DslChild {
            name: c.name,
            dir_objid: c.dir_obj,
        })
        .collect();
    Ok(DslChildren {
        dir_objid: dir,
        child_dir_zapobj: dd.child_dir_zapobj,
        children,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DslHead {
    pub dir_objid: u64,
    pub head_dataset_obj: u64,
}

pub fn dsl_dir_head(session: &PoolSession, dir: u64) -> Result<DslHead, ZfsError> {
    let _guard = session.read_guard();
    let dd = dir_phys(&session.mos_store(), dir)?;
    Ok(DslHead {
        dir_objid: dir,
        head_dataset_obj: dd.head_dataset_obj,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DslRoot {
    pub root_dataset_obj: u64,
    pub root_dir_obj: u64,
}

/// The pool's root DSL directory, from the object directory, and its head dataset
pub fn dsl_root_dir(session: &PoolSession) -> Result<DslRoot, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let root_dir_obj = root_dir_obj(&store)?;
    let dd = dir_phys(&store, root_dir_obj)?;
    Ok(DslRoot {
        root_dataset_obj: dd.head_dataset_obj,
        root_dir_obj,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetObjset {
    pub dataset_obj: u64,
    /// Objset scopes are addressed by their dataset object id
    pub objset_id: u64,
    pub rootbp: BlkptrFields,
}

pub fn dataset_objset(session: &PoolSession, dsobj: u64) -> Result<DatasetObjset, ZfsError> {
    let _guard = session.read_guard();
    let ds = session.dataset(dsobj)?;
    Ok(DatasetObjset {
        dataset_obj: dsobj,
        objset_id: dsobj,
        rootbp: (&ds.bp).into(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRef {
    pub name: String,
    pub dsobj: u64,
    pub creation_txg: u64,
    pub guid: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSnapshots {
    pub dataset_obj: u64,
    pub snapnames_zapobj: u64,
    pub count: u64,
    pub snapshots: Vec<SnapshotRef>,
}

/// Snapshots named in the snapshot map of `dsobj`, oldest first. Entries that do not name a
/// DSL dataset are left out.
pub fn dataset_snapshots(session: &PoolSession, dsobj: u64) -> Result<DatasetSnapshots, ZfsError> {
    let _guard = session.read_guard();
    let ds = session.dataset(dsobj)?;
    let mut snapshots = vec![];
    if ds.snapnames_zapobj != 0 {
        let store = session.mos_store();
        for e in map_entries(&store, ds.snapnames_zapobj)? {
            let snap = match e.single_u64() {
                Some(s) => s,
                None => continue,
            };
            match session.dataset(snap) {
                Ok(s) => snapshots.push(SnapshotRef {
                    name: e.name(),
                    dsobj: snap,
                    creation_txg: s.creation_txg,
                    guid: s.guid,
                }),
                Err(err) => debug!(dsobj, snap, error = %err, "stale snapshot entry skipped"),
            }
        }
    }
    snapshots.sort_by_key(|s| (s.creation_txg, s.dsobj));
    Ok(DatasetSnapshots {
        dataset_obj: dsobj,
        snapnames_zapobj: ds.snapnames_zapobj,
        count: snapshots.len() as u64,
        snapshots,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCount {
    pub dir_obj: u64,
    pub head_dataset_obj: u64,
    pub snapnames_zapobj: u64,
    /// Entries in the snapshot map, taken from its header
    pub count: u64,
}

/// Number of snapshots of the head dataset of DSL directory `dir`, without reading them
pub fn dataset_snapshot_count(session: &PoolSession, dir: u64) -> Result<SnapshotCount, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let dd = dir_phys(&store, dir)?;
    if dd.head_dataset_obj == 0 {
        return not_found(format!("DSL directory {} has no head dataset", dir));
    }
    let ds = session.dataset(dd.head_dataset_obj)?;
    let count = if ds.snapnames_zapobj == 0 {
        0
    } else {
        store.zap_count(ds.snapnames_zapobj)?
    };
    Ok(SnapshotCount {
        dir_obj: dir,
        head_dataset_obj: dd.head_dataset_obj,
        snapnames_zapobj: ds.snapnames_zapobj,
        count,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetTreeNode {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub depth: u64,
    pub name: String,
    pub dsl_dir_obj: u64,
    pub head_dataset_obj: Option<u64>,
    pub child_dir_zapobj: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetTree {
    pub root_dir_obj: u64,
    pub max_depth: u64,
    pub max_nodes: u64,
    pub count: u64,
    pub truncated: bool,
    /// Pre-order; the root directory comes first and carries the pool name
    pub nodes: Vec<DatasetTreeNode>,
}

/// The DSL directory hierarchy from the pool's root directory down. Zero caps select the
/// defaults.
pub fn dataset_tree(
    session: &PoolSession,
    max_depth: u64,
    max_nodes: u64,
) -> Result<DatasetTree, ZfsError> {
    let _guard = session.read_guard();
    let store = session.mos_store();
    let root = root_dir_obj(&store)?;
    let tree = dsl_tree(&store, root, session.name(), max_depth, max_nodes)?;
    let nonzero = |v: u64| if v == 0 { None } else { Some(v) };
    let nodes: Vec<DatasetTreeNode> = tree
        .nodes
        .into_iter()
        .map(|n| DatasetTreeNode {
            id: n.id,
            parent_id: n.parent_id,
            depth: n.depth,
            name: n.name,
            dsl_dir_obj: n.dir_obj,
            head_dataset_obj: nonzero(n.phys.head_dataset_obj),
            child_dir_zapobj: nonzero(n.phys.child_dir_zapobj),
        })
        .collect();
    Ok(DatasetTree {
        root_dir_obj: root,
        max_depth: tree.max_depth,
        max_nodes: tree.max_nodes,
        count: nodes.len() as u64,
        truncated: tree.truncated,
        nodes,
    })
}

pub fn snapshot_lineage(
    session: &PoolSession,
    dsobj: u64,
    max_prev: u64,
    max_next: u64,
) -> Result<Lineage, ZfsError> {
    let _guard = session.read_guard();
    walk_lineage(session, dsobj, max_prev, max_next)
}

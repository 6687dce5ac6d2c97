//!
//! The DSL directory hierarchy below one directory
//!
//! Directories are emitted in pre-order off an explicit stack. A child map entry only counts
//! when it names a DSL directory; anything else is skipped.
//!
use std::collections::HashSet;

use tracing::debug;

use crate::catalog::DMU_OT_DSL_DIR;
use crate::dsl::{DirPhys, DSL_DIR_PHYS_SIZE};
use crate::limits::{dsl_tree_depth, dsl_tree_nodes};
use crate::store::ObjectStore;
use crate::zap_cursor::ZapCursor;
use crate::{type_mismatch, ZfsError};

/// The DSL directory record of `obj`
pub fn dir_phys(store: &ObjectStore<'_>, obj: u64) -> Result<DirPhys, ZfsError> {
    let dn = store.get_object(obj)?;
    if dn.header.bonus_type != DMU_OT_DSL_DIR || dn.bonus.len() < DSL_DIR_PHYS_SIZE {
        return type_mismatch(format!("object {} is not a DSL directory", obj));
    }
    Ok(DirPhys::parse(&dn.bonus)?.1)
}

#[derive(Debug, Clone)]
pub struct ChildDir {
    pub name: String,
    pub dir_obj: u64,
    pub phys: DirPhys,
}

/// Children of a directory whose record is `dd`, in cursor order
pub fn child_dirs(store: &ObjectStore<'_>, dir: u64, dd: &DirPhys) -> Result<Vec<ChildDir>, ZfsError> {
    let mut out = vec![];
    if dd.child_dir_zapobj == 0 {
        return Ok(out);
    }
    let mut zc = ZapCursor::init(store, dd.child_dir_zapobj)?;
    while let Some(e) = zc.retrieve()? {
        zc.advance();
        let child = match e.single_u64() {
            Some(c) => c,
            None => continue,
        };
        match dir_phys(store, child) {
            Ok(phys) => out.push(ChildDir {
                name: e.name(),
                dir_obj: child,
                phys,
            }),
            Err(err) => debug!(dir, child, error = %err, "stale child entry skipped"),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DslTreeNode {
    /// Position in pre-order; the starting directory is 0
    pub id: u64,
    pub parent_id: Option<u64>,
    pub depth: u64,
    pub name: String,
    pub dir_obj: u64,
    pub phys: DirPhys,
}

#[derive(Debug, Clone)]
pub struct DslTree {
    pub max_depth: u64,
    pub max_nodes: u64,
    pub nodes: Vec<DslTreeNode>,
    /// Some directory was left out by either cap
    pub truncated: bool,
}

struct Pending {
    name: String,
    dir_obj: u64,
    phys: DirPhys,
    parent_id: Option<u64>,
    depth: u64,
}

/// Walk the directories under `root`, which is reported as `name`. Zero caps select the
/// defaults.
pub fn dsl_tree(
    store: &ObjectStore<'_>,
    root: u64,
    name: &str,
    max_depth: u64,
    max_nodes: u64,
) -> Result<DslTree, ZfsError> {
    let max_depth = dsl_tree_depth(max_depth);
    let max_nodes = dsl_tree_nodes(max_nodes);
    let mut stack = vec![Pending {
        name: name.to_string(),
        dir_obj: root,
        phys: dir_phys(store, root)?,
        parent_id: None,
        depth: 0,
    }];
    let mut visited = HashSet::new();
    let mut nodes: Vec<DslTreeNode> = vec![];
    let mut truncated = false;
    while let Some(p) = stack.pop() {
        if !visited.insert(p.dir_obj) {
            debug!(dir = p.dir_obj, "directory reached twice, skipped");
            continue;
        }
        if nodes.len() as u64 >= max_nodes {
            truncated = true;
            break;
        }
        let id = nodes.len() as u64;
        let children = match child_dirs(store, p.dir_obj, &p.phys) {
            Ok(c) => c,
            Err(err) => {
                debug!(dir = p.dir_obj, error = %err, "child map unreadable");
                vec![]
            }
        };
        if p.depth < max_depth {
            for c in children.into_iter().rev() {
                stack.push(Pending {
                    name: c.name,
                    dir_obj: c.dir_obj,
                    phys: c.phys,
                    parent_id: Some(id),
                    depth: p.depth + 1,
                });
            }
        } else if !children.is_empty() {
            truncated = true;
        }
        nodes.push(DslTreeNode {
            id,
            parent_id: p.parent_id,
            depth: p.depth,
            name: p.name,
            dir_obj: p.dir_obj,
            phys: p.phys,
        });
    }
    if truncated {
        debug!(root, nodes = nodes.len(), max_depth, max_nodes, "dsl tree truncated");
    }
    Ok(DslTree {
        max_depth,
        max_nodes,
        nodes,
        truncated,
    })
}

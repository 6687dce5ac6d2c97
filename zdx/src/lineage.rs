//!
//! Snapshot lineage: the prev/next snapshot chain around one dataset
//!
use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::dsl::DatasetPhys;
use crate::limits::lineage_steps;
use crate::session::PoolSession;
use crate::{precondition, ZfsError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageEntry {
    pub dsobj: u64,
    pub guid: u64,
    pub creation_txg: u64,
    pub creation_time: u64,
    pub referenced_bytes: u64,
    pub unique_bytes: u64,
    pub prev_snap_obj: u64,
    pub next_snap_obj: u64,
}

impl LineageEntry {
    fn new(dsobj: u64, ds: &DatasetPhys) -> Self {
        Self {
            dsobj,
            guid: ds.guid,
            creation_txg: ds.creation_txg,
            creation_time: ds.creation_time,
            referenced_bytes: ds.referenced_bytes,
            unique_bytes: ds.unique_bytes,
            prev_snap_obj: ds.prev_snap_obj,
            next_snap_obj: ds.next_snap_obj,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Lineage {
    pub start: u64,
    pub max_prev: u64,
    pub max_next: u64,
    /// Oldest first; the start dataset sits between the two directions
    pub entries: Vec<LineageEntry>,
    pub back_truncated: bool,
    pub forward_truncated: bool,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Back,
    Forward,
}

impl Direction {
    fn link(self, ds: &DatasetPhys) -> u64 {
        match self {
            Direction::Back => ds.prev_snap_obj,
            Direction::Forward => ds.next_snap_obj,
        }
    }
}

/// Follow one direction of the chain from `from`, returning the datasets reached in walk
/// order and whether the walk was cut short
fn follow(
    session: &PoolSession,
    from: &DatasetPhys,
    dir: Direction,
    cap: u64,
    visited: &mut HashSet<u64>,
) -> (Vec<LineageEntry>, bool) {
    let mut out = vec![];
    let mut next = dir.link(from);
    while next != 0 {
        if out.len() as u64 >= cap {
            return (out, true);
        }
        if !visited.insert(next) {
            debug!(dsobj = next, direction = ?dir, "snapshot chain revisits a dataset");
            return (out, true);
        }
        let ds = match session.dataset(next) {
            Ok(ds) => ds,
            Err(e) => {
                debug!(dsobj = next, direction = ?dir, error = %e, "snapshot chain broken");
                return (out, true);
            }
        };
        out.push(LineageEntry::new(next, &ds));
        next = dir.link(&ds);
    }
    (out, false)
}

/// Walk backward along `prev_snap_obj` and forward along `next_snap_obj` from `dsobj`.
/// Zero caps select the default; every cap is held under a fixed ceiling.
pub fn walk_lineage(
    session: &PoolSession,
    dsobj: u64,
    max_prev: u64,
    max_next: u64,
) -> Result<Lineage, ZfsError> {
    if dsobj == 0 {
        return precondition("dataset object id must be non-zero");
    }
    let max_prev = lineage_steps(max_prev);
    let max_next = lineage_steps(max_next);
    let start = session.dataset(dsobj)?;
    let mut visited = HashSet::new();
    visited.insert(dsobj);

    let (mut back, back_truncated) =
        follow(session, &start, Direction::Back, max_prev, &mut visited);
    let (forward, forward_truncated) =
        follow(session, &start, Direction::Forward, max_next, &mut visited);

    back.reverse();
    let mut entries = back;
    entries.push(LineageEntry::new(dsobj, &start));
    entries.extend(forward);
    Ok(Lineage {
        start: dsobj,
        max_prev,
        max_next,
        entries,
        back_truncated,
        forward_truncated,
    })
}

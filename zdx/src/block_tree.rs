//!
//! Descent through an object's indirect block tree
//!
//! Node 0 is the dnode itself. Every block pointer reached becomes one node, emitted in
//! pre-order, and the walk runs off an explicit stack so on-disk depth never turns into call
//! depth.
//!
use tracing::{debug, trace};

use crate::dmu::DNodePhys;
use crate::limits::{block_tree_depth, block_tree_nodes};
use crate::spa::{BlockPtr, BLKPTR_SIZE};
use crate::store::ObjectStore;
use crate::ZfsError;

#[derive(Debug, Clone)]
pub struct BlockNode {
    pub id: u64,
    pub parent_id: u64,
    /// Slot within the parent: the dnode's pointer array or the parent indirect block
    pub edge_index: u64,
    pub is_spill: bool,
    pub blkid: u64,
    /// Edges from the dnode; top-level pointers sit at depth 0
    pub depth: u64,
    /// Pointers an indirect block at this level holds, 0 for level 0
    pub child_slots: u64,
    pub bp: BlockPtr,
}

#[derive(Debug, Clone)]
pub struct BlockTree {
    pub object: u64,
    pub dnode: DNodePhys,
    pub max_depth: u64,
    pub max_nodes: u64,
    /// Block pointer nodes; the dnode is node 0 and is not listed
    pub nodes: Vec<BlockNode>,
    pub truncated: bool,
}

impl BlockTree {
    /// Nodes including the dnode
    pub fn count(&self) -> u64 {
        self.nodes.len() as u64 + 1
    }
}

struct Pending {
    bp: BlockPtr,
    blkid: u64,
    parent_id: u64,
    edge_index: u64,
    is_spill: bool,
    depth: u64,
}

/// First level-0 block id covered by block `blkid` at `level`, saturating for absurd shifts
fn first_l0(blkid: u64, level: u8, shift: u64) -> u64 {
    let bits = level as u64 * shift;
    if bits >= 64 {
        if blkid == 0 {
            0
        } else {
            u64::MAX
        }
    } else if blkid > u64::MAX >> bits {
        u64::MAX
    } else {
        blkid << bits
    }
}

/// Walk the block tree of `object`. Zero caps select the defaults.
pub fn block_tree(
    store: &ObjectStore<'_>,
    object: u64,
    max_depth: u64,
    max_nodes: u64,
) -> Result<BlockTree, ZfsError> {
    let max_depth = block_tree_depth(max_depth);
    let max_nodes = block_tree_nodes(max_nodes);
    let dnode = store.get_object(object)?;
    let slots = dnode.pointers_per_indirect();
    let shift = slots.trailing_zeros() as u64;
    let maxblkid = dnode.header.max_block_id;

    let mut stack = Vec::with_capacity(dnode.block_pointers.len() + 1);
    if let Some(spill) = &dnode.spill {
        stack.push(Pending {
            bp: spill.clone(),
            blkid: 0,
            parent_id: 0,
            edge_index: dnode.block_pointers.len() as u64,
            is_spill: true,
            depth: 0,
        });
    }
    for (i, bp) in dnode.block_pointers.iter().enumerate().rev() {
        stack.push(Pending {
            bp: bp.clone(),
            blkid: i as u64,
            parent_id: 0,
            edge_index: i as u64,
            is_spill: false,
            depth: 0,
        });
    }

    let mut nodes: Vec<BlockNode> = vec![];
    let mut truncated = false;
    while let Some(p) = stack.pop() {
        // the dnode counts against the cap
        if nodes.len() as u64 + 1 >= max_nodes {
            truncated = true;
            break;
        }
        let id = nodes.len() as u64 + 1;
        let level = p.bp.indirection_level;
        let child_slots = if level > 0 { slots } else { 0 };
        let descendable = !p.bp.is_hole() && !p.bp.is_embedded() && level > 0 && !p.is_spill;
        if descendable && p.depth >= max_depth {
            truncated = true;
        }
        if descendable && p.depth < max_depth {
            match store.read_indirect(&p.bp) {
                Ok(block) => {
                    let children = (block.len() / BLKPTR_SIZE).min(slots as usize);
                    for i in (0..children).rev() {
                        let blkid = p.blkid.saturating_mul(slots).saturating_add(i as u64);
                        if first_l0(blkid, level - 1, shift) > maxblkid {
                            continue;
                        }
                        match BlockPtr::parse(&block[i * BLKPTR_SIZE..]) {
                            Ok((_, bp)) => stack.push(Pending {
                                bp,
                                blkid,
                                parent_id: id,
                                edge_index: i as u64,
                                is_spill: false,
                                depth: p.depth + 1,
                            }),
                            Err(e) => {
                                trace!(object, blkid, error = ?e, "child pointer undecodable")
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(object, blkid = p.blkid, level, error = %e, "indirect block skipped");
                }
            }
        }
        nodes.push(BlockNode {
            id,
            parent_id: p.parent_id,
            edge_index: p.edge_index,
            is_spill: p.is_spill,
            blkid: p.blkid,
            depth: p.depth,
            child_slots,
            bp: p.bp,
        });
    }
    if truncated {
        debug!(object, nodes = nodes.len(), max_depth, max_nodes, "block tree truncated");
    }
    Ok(BlockTree {
        object,
        dnode,
        max_depth,
        max_nodes,
        nodes,
        truncated,
    })
}

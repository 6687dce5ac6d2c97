//!
//! Block tree view: the dnode as node 0 followed by every block pointer reached, pre-order
//!
use serde::Serialize;

use crate::block_tree::{block_tree, BlockNode};
use crate::session::{PoolSession, Scope};
use crate::view::BlkptrFields;
use crate::ZfsError;

#[derive(Debug, Clone, Serialize)]
pub struct DnodeNode {
    pub id: u64,
    pub kind: &'static str,
    pub object: u64,
    pub nlevels: u8,
    pub nblkptr: u8,
    pub indblkshift: u8,
    pub datablksz: u64,
    pub maxblkid: u64,
    pub has_spill: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlkptrNode {
    pub id: u64,
    pub kind: &'static str,
    pub parent_id: u64,
    pub edge_index: u64,
    pub is_spill: bool,
    pub blkid: u64,
    pub depth: u64,
    pub child_slots: u64,
    #[serde(flatten)]
    pub bp: BlkptrFields,
}

impl From<&BlockNode> for BlkptrNode {
    fn from(n: &BlockNode) -> Self {
        Self {
            id: n.id,
            kind: "blkptr",
            parent_id: n.parent_id,
            edge_index: n.edge_index,
            is_spill: n.is_spill,
            blkid: n.blkid,
            depth: n.depth,
            child_slots: n.child_slots,
            bp: (&n.bp).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TreeNode {
    Dnode(DnodeNode),
    Blkptr(BlkptrNode),
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockTreeView {
    /// `mos` or `objset`
    pub scope: &'static str,
    pub objset_id: Option<u64>,
    pub object: u64,
    pub max_depth: u64,
    pub max_nodes: u64,
    pub count: u64,
    pub truncated: bool,
    pub nodes: Vec<TreeNode>,
}

/// The indirect block tree of object `obj`. Zero caps select the defaults.
pub fn object_block_tree(
    session: &PoolSession,
    scope: Scope,
    obj: u64,
    max_depth: u64,
    max_nodes: u64,
) -> Result<BlockTreeView, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    let tree = block_tree(&store, obj, max_depth, max_nodes)?;
    let h = &tree.dnode.header;
    let mut nodes = Vec::with_capacity(tree.nodes.len() + 1);
    nodes.push(TreeNode::Dnode(DnodeNode {
        id: 0,
        kind: "dnode",
        object: obj,
        nlevels: h.levels,
        nblkptr: h.num_block_ptr,
        indblkshift: h.indirect_block_shift,
        datablksz: tree.dnode.data_block_size(),
        maxblkid: h.max_block_id,
        has_spill: tree.dnode.spill.is_some(),
    }));
    nodes.extend(tree.nodes.iter().map(|n| TreeNode::Blkptr(n.into())));
    Ok(BlockTreeView {
        scope: scope.as_str(),
        objset_id: scope.objset_id(),
        object: obj,
        max_depth: tree.max_depth,
        max_nodes: tree.max_nodes,
        count: tree.count(),
        truncated: tree.truncated,
        nodes,
    })
}

//!
//! Object views: paginated listing, the full descriptor of one object with its decoded bonus
//! and typed edges, its block pointers, and the combined fetch
//!
use serde::Serialize;
use tracing::debug;

use crate::catalog::{
    is_zap, type_name, DMU_OT_DSL_DATASET, DMU_OT_DSL_DIR, DMU_OT_SA, DMU_OT_SPACE_MAP,
    DMU_OT_SPACE_MAP_HEADER, DMU_OT_ZNODE,
};
use crate::dmu::DNodePhys;
use crate::dsl::{DatasetPhys, DirPhys, DSL_DATASET_PHYS_SIZE, DSL_DIR_PHYS_SIZE};
use crate::limits::{object_page, ZAP_PAGE_DEFAULT};
use crate::session::{PoolSession, Scope};
use crate::spacemap::{SpaceMapPhys, SPACE_MAP_SIZE_V0};
use crate::store::ObjectStore;
use crate::view::zap::{build_zap_entries, build_zap_info, ZapEntries, ZapInfo};
use crate::view::{BlkptrView, TypeRef};
use crate::zpl::read_attrs;
use crate::ZfsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: u8,
    pub type_name: &'static str,
    pub bonus_type: u8,
    pub bonus_type_name: &'static str,
}

impl ObjectSummary {
    fn new(id: u64, dn: &DNodePhys) -> Self {
        Self {
            id,
            kind: dn.kind(),
            type_name: type_name(dn.kind()),
            bonus_type: dn.header.bonus_type,
            bonus_type_name: type_name(dn.header.bonus_type),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectList {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objset_id: Option<u64>,
    pub start: u64,
    pub limit: u64,
    pub count: u64,
    /// Pass back as `start` to continue
    pub next: Option<u64>,
    pub objects: Vec<ObjectSummary>,
}

/// Allocated objects with ids greater than `start`, optionally only those of one type
pub fn list_objects(
    session: &PoolSession,
    scope: Scope,
    type_filter: Option<u8>,
    start: u64,
    limit: u64,
) -> Result<ObjectList, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    let limit = object_page(limit);
    let mut walk = store.list_objects(start);
    let mut objects = vec![];
    let mut last = start;
    while (objects.len() as u64) < limit {
        match walk.next() {
            Some(Ok((id, dn))) => {
                last = id;
                if type_filter.map_or(true, |t| t == dn.kind()) {
                    objects.push(ObjectSummary::new(id, &dn));
                }
            }
            Some(Err(e)) => debug!(position = walk.position(), error = %e, "object skipped"),
            None => break,
        }
    }
    // a full page continues only when some object remains past it
    let next = if objects.len() as u64 == limit && walk.next().is_some() {
        Some(last)
    } else {
        None
    };
    Ok(ObjectList {
        objset_id: scope.objset_id(),
        start,
        limit,
        count: objects.len() as u64,
        next,
        objects,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DslDirBonus {
    pub creation_time: u64,
    pub head_dataset_obj: u64,
    pub parent_dir_obj: u64,
    pub origin_obj: u64,
    pub child_dir_zapobj: u64,
    pub props_zapobj: u64,
    pub used_bytes: u64,
    pub quota: u64,
    pub reserved: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DslDatasetBonus {
    pub dir_obj: u64,
    pub prev_snap_obj: u64,
    pub next_snap_obj: u64,
    pub snapnames_zapobj: u64,
    pub deadlist_obj: u64,
    pub next_clones_obj: u64,
    pub props_obj: u64,
    pub userrefs_obj: u64,
    pub num_children: u64,
    pub creation_time: u64,
    pub creation_txg: u64,
    pub referenced_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub unique_bytes: u64,
    pub fsid_guid: u64,
    pub guid: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceMapBonus {
    pub object: u64,
    pub length: u64,
    pub alloc: i64,
    pub has_histogram: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZnodeBonus {
    pub mode: u64,
    pub size: u64,
    pub parent: u64,
    pub links: u64,
    pub uid: u64,
    pub gid: u64,
    pub gen: u64,
    pub partial: bool,
}

/// The bonus buffer decoded according to its bonus type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BonusDecoded {
    DslDir(DslDirBonus),
    DslDataset(DslDatasetBonus),
    SpaceMap(SpaceMapBonus),
    Znode(ZnodeBonus),
}

/// A reference from one object to another, read out of a typed field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticEdge {
    pub source_obj: u64,
    pub target_obj: u64,
    pub label: &'static str,
    pub kind: &'static str,
    pub confidence: f64,
}

struct Edges {
    source: u64,
    edges: Vec<SemanticEdge>,
}

impl Edges {
    fn add(&mut self, target: u64, label: &'static str, kind: &'static str) {
        if target != 0 {
            self.edges.push(SemanticEdge {
                source_obj: self.source,
                target_obj: target,
                label,
                kind,
                confidence: 1.0,
            });
        }
    }
}

fn decode_bonus(
    store: &ObjectStore<'_>,
    id: u64,
    dn: &DNodePhys,
) -> (Option<BonusDecoded>, Vec<SemanticEdge>) {
    let mut edges = Edges {
        source: id,
        edges: vec![],
    };
    let bonus = &dn.bonus;
    let decoded = match dn.header.bonus_type {
        DMU_OT_DSL_DIR if bonus.len() >= DSL_DIR_PHYS_SIZE => {
            DirPhys::parse(bonus).ok().map(|(_, dd)| {
                edges.add(dd.child_dir_zapobj, "child_dir_zapobj", "dsl_child_dir_zapobj");
                edges.add(dd.head_dataset_obj, "head_dataset_obj", "dsl_head_dataset_obj");
                edges.add(dd.props_zapobj, "props_zapobj", "dsl_props_zapobj");
                edges.add(dd.origin_obj, "origin_obj", "dsl_origin_obj");
                edges.add(dd.parent_obj, "parent_dir_obj", "dsl_parent_dir_obj");
                BonusDecoded::DslDir(DslDirBonus {
                    creation_time: dd.creation_time,
                    head_dataset_obj: dd.head_dataset_obj,
                    parent_dir_obj: dd.parent_obj,
                    origin_obj: dd.origin_obj,
                    child_dir_zapobj: dd.child_dir_zapobj,
                    props_zapobj: dd.props_zapobj,
                    used_bytes: dd.used_bytes,
                    quota: dd.quota,
                    reserved: dd.reserved,
                })
            })
        }
        DMU_OT_DSL_DATASET if bonus.len() >= DSL_DATASET_PHYS_SIZE => {
            DatasetPhys::parse(bonus).ok().map(|(_, ds)| {
                edges.add(ds.dir_obj, "dir_obj", "dsl_dataset_dir_obj");
                edges.add(ds.prev_snap_obj, "prev_snap_obj", "dsl_dataset_prev_snap_obj");
                edges.add(ds.next_snap_obj, "next_snap_obj", "dsl_dataset_next_snap_obj");
                edges.add(
                    ds.snapnames_zapobj,
                    "snapnames_zapobj",
                    "dsl_dataset_snapnames_zapobj",
                );
                edges.add(ds.deadlist_obj, "deadlist_obj", "dsl_dataset_deadlist_obj");
                edges.add(
                    ds.next_clones_obj,
                    "next_clones_obj",
                    "dsl_dataset_next_clones_obj",
                );
                edges.add(ds.props_obj, "props_obj", "dsl_dataset_props_obj");
                edges.add(ds.userrefs_obj, "userrefs_obj", "dsl_dataset_userrefs_obj");
                BonusDecoded::DslDataset(DslDatasetBonus {
                    dir_obj: ds.dir_obj,
                    prev_snap_obj: ds.prev_snap_obj,
                    next_snap_obj: ds.next_snap_obj,
                    snapnames_zapobj: ds.snapnames_zapobj,
                    deadlist_obj: ds.deadlist_obj,
                    next_clones_obj: ds.next_clones_obj,
                    props_obj: ds.props_obj,
                    userrefs_obj: ds.userrefs_obj,
                    num_children: ds.num_children,
                    creation_time: ds.creation_time,
                    creation_txg: ds.creation_txg,
                    referenced_bytes: ds.referenced_bytes,
                    compressed_bytes: ds.compressed_bytes,
                    uncompressed_bytes: ds.uncompressed_bytes,
                    unique_bytes: ds.unique_bytes,
                    fsid_guid: ds.fsid_guid,
                    guid: ds.guid,
                    flags: ds.flags,
                })
            })
        }
        DMU_OT_SPACE_MAP_HEADER
            if dn.kind() == DMU_OT_SPACE_MAP && bonus.len() >= SPACE_MAP_SIZE_V0 =>
        {
            SpaceMapPhys::parse(bonus).ok().map(|(_, sm)| {
                BonusDecoded::SpaceMap(SpaceMapBonus {
                    object: sm.object,
                    length: sm.length,
                    alloc: sm.alloc,
                    has_histogram: sm.histogram.is_some(),
                })
            })
        }
        DMU_OT_SA | DMU_OT_ZNODE if store.scope() != Scope::Mos => {
            match read_attrs(store, id) {
                Ok(z) => {
                    // the root directory is its own parent
                    if z.parent != id {
                        edges.add(z.parent, "parent", "znode_parent");
                    }
                    Some(BonusDecoded::Znode(ZnodeBonus {
                        mode: z.mode,
                        size: z.size,
                        parent: z.parent,
                        links: z.links,
                        uid: z.uid,
                        gid: z.gid,
                        gen: z.gen,
                        partial: z.partial,
                    }))
                }
                Err(e) => {
                    debug!(id, error = %e, "znode bonus not decoded");
                    None
                }
            }
        }
        _ => None,
    };
    (decoded, edges.edges)
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objset_id: Option<u64>,
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: TypeRef,
    pub bonus_type: TypeRef,
    pub is_zap: bool,
    pub bonus_decoded: Option<BonusDecoded>,
    pub semantic_edges: Vec<SemanticEdge>,
    pub nlevels: u8,
    pub nblkptr: u8,
    pub indblkshift: u8,
    pub indirect_block_size: u64,
    pub data_block_size: u64,
    pub metadata_block_size: u64,
    pub bonus_size: u64,
    pub bonus_len: u16,
    pub checksum: u8,
    pub compress: u8,
    pub flags: u8,
    pub maxblkid: u64,
    pub used_bytes: u64,
    pub fill_count: u64,
    pub physical_blocks_512: u64,
    pub max_offset: u64,
    pub indirection: u8,
    pub dnodesize: u64,
    pub has_spill: bool,
}

fn build_object(store: &ObjectStore<'_>, id: u64) -> Result<ObjectView, ZfsError> {
    let dn = store.get_object(id)?;
    let (bonus_decoded, semantic_edges) = decode_bonus(store, id, &dn);
    let h = &dn.header;
    Ok(ObjectView {
        objset_id: store.scope().objset_id(),
        id,
        kind: TypeRef::new(h.kind),
        bonus_type: TypeRef::new(h.bonus_type),
        is_zap: is_zap(h.kind),
        bonus_decoded,
        semantic_edges,
        nlevels: h.levels,
        nblkptr: h.num_block_ptr,
        indblkshift: h.indirect_block_shift,
        indirect_block_size: dn.indirect_block_size(),
        data_block_size: dn.data_block_size(),
        metadata_block_size: dn.indirect_block_size(),
        bonus_size: dn.bonus.len() as u64,
        bonus_len: h.bonus_len,
        checksum: h.checksum,
        compress: h.compress,
        flags: h.flags,
        maxblkid: h.max_block_id,
        used_bytes: dn.used_bytes(),
        fill_count: dn.fill_count(),
        physical_blocks_512: dn.physical_blocks_512(),
        max_offset: dn.max_offset(),
        indirection: h.levels,
        dnodesize: dn.dnode_size() as u64,
        has_spill: h.has_spill(),
    })
}

pub fn get_object(session: &PoolSession, scope: Scope, id: u64) -> Result<ObjectView, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    build_object(&store, id)
}

#[derive(Debug, Clone, Serialize)]
pub struct BlkptrList {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objset_id: Option<u64>,
    pub id: u64,
    pub nblkptr: u64,
    pub has_spill: bool,
    /// The spill pointer, when present, comes last with index `nblkptr`
    pub blkptrs: Vec<BlkptrView>,
}

fn build_blkptrs(store: &ObjectStore<'_>, id: u64) -> Result<BlkptrList, ZfsError> {
    let ptrs = store.get_block_pointers(id)?;
    let mut blkptrs: Vec<BlkptrView> = ptrs
        .direct
        .iter()
        .enumerate()
        .map(|(i, bp)| BlkptrView::new(i as u64, false, bp))
        .collect();
    if let Some(spill) = &ptrs.spill {
        blkptrs.push(BlkptrView::new(ptrs.nblkptr as u64, true, spill));
    }
    Ok(BlkptrList {
        objset_id: store.scope().objset_id(),
        id,
        nblkptr: ptrs.nblkptr as u64,
        has_spill: ptrs.spill.is_some(),
        blkptrs,
    })
}

pub fn get_blkptrs(session: &PoolSession, scope: Scope, id: u64) -> Result<BlkptrList, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    build_blkptrs(&store, id)
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjGet {
    pub object: ObjectView,
    pub blkptrs: BlkptrList,
    pub zap_info: Option<ZapInfo>,
    /// The first page of entries
    pub zap_entries: Option<ZapEntries>,
}

/// Descriptor, block pointers and, for ZAP objects, the header and first entry page
pub fn obj_get(session: &PoolSession, scope: Scope, id: u64) -> Result<ObjGet, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    let object = build_object(&store, id)?;
    let blkptrs = build_blkptrs(&store, id)?;
    let (zap_info, zap_entries) = if object.is_zap {
        (
            Some(build_zap_info(&store, id)?),
            Some(build_zap_entries(&store, id, 0, ZAP_PAGE_DEFAULT)?),
        )
    } else {
        (None, None)
    };
    Ok(ObjGet {
        object,
        blkptrs,
        zap_info,
        zap_entries,
    })
}

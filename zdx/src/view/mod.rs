//!
//! Response shapes
//!
//! Each builder holds the session read guard for its whole run and assembles one
//! `Serialize` struct from the lower layers. Paginated views carry `cursor`/`start`, `limit`,
//! `count` and a `next` that is `None` once the walk is exhausted.
//!
use serde::Serialize;

use crate::catalog::type_name;
use crate::spa::{BlockPtr, DVA};

pub mod dsl;
pub mod object;
pub mod pool;
pub mod spacemap;
pub mod tree;
pub mod zap;
pub mod zpl;

/// A type code with its catalog name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeRef {
    pub id: u8,
    pub name: &'static str,
}

impl TypeRef {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            name: type_name(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DvaView {
    pub vdev: u64,
    pub offset: u64,
    pub asize: u64,
    pub is_gang: bool,
}

impl From<&DVA> for DvaView {
    fn from(dva: &DVA) -> Self {
        Self {
            vdev: dva.vdev as u64,
            offset: dva.offset_bytes(),
            asize: dva.asize_bytes(),
            is_gang: dva.gang,
        }
    }
}

/// The decoded fields of one block pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlkptrFields {
    pub is_hole: bool,
    pub is_embedded: bool,
    pub is_gang: bool,
    pub level: u8,
    #[serde(rename = "type")]
    pub kind: u8,
    pub lsize: u64,
    pub psize: u64,
    pub asize: u64,
    pub birth_txg: u64,
    pub logical_birth: u64,
    pub physical_birth: u64,
    pub fill: u64,
    pub checksum: u8,
    pub compression: u8,
    pub dedup: bool,
    pub ndvas: usize,
    pub dvas: Vec<DvaView>,
}

impl From<&BlockPtr> for BlkptrFields {
    fn from(bp: &BlockPtr) -> Self {
        Self {
            is_hole: bp.is_hole(),
            is_embedded: bp.is_embedded(),
            is_gang: bp.is_gang(),
            level: bp.indirection_level,
            kind: bp.kind,
            lsize: bp.lsize(),
            psize: bp.psize(),
            asize: bp.asize(),
            birth_txg: bp.birth_txg(),
            logical_birth: bp.logical_birth(),
            physical_birth: bp.physical_birth(),
            fill: bp.fill(),
            checksum: bp.checksum_code(),
            compression: bp.compression,
            dedup: bp.dedup,
            ndvas: bp.ndvas(),
            dvas: bp.dvas().map(DvaView::from).collect(),
        }
    }
}

/// A block pointer together with its slot in the owning dnode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlkptrView {
    pub index: u64,
    pub is_spill: bool,
    #[serde(flatten)]
    pub bp: BlkptrFields,
}

impl BlkptrView {
    pub fn new(index: u64, is_spill: bool, bp: &BlockPtr) -> Self {
        Self {
            index,
            is_spill,
            bp: bp.into(),
        }
    }
}

/// A `{sec, nsec}` timestamp pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u64,
}

impl From<[u64; 2]> for Timespec {
    fn from(t: [u64; 2]) -> Self {
        Self {
            sec: t[0],
            nsec: t[1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::BpSpec;

    #[test]
    fn hole_pointer_has_no_dvas() {
        let bp = BpSpec::default().parse();
        let view = BlkptrView::new(0, false, &bp);
        assert!(view.bp.is_hole);
        assert_eq!(view.bp.ndvas, 0);
        assert!(view.bp.dvas.is_empty());
        let json = serde_json::to_value(&view).expect("serializes");
        assert_eq!(json["index"], 0);
        assert_eq!(json["is_hole"], true);
        assert!(json.get("bp").is_none(), "fields are flattened");
    }

    #[test]
    fn unknown_type_code_is_labelled() {
        assert_eq!(TypeRef::new(u8::MAX).name, "unknown");
    }
}

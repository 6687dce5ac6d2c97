//!
//! DMU object type catalog
//!
//! Type codes index a fixed table. Codes with the `NEWTYPE` bit carry their byteswap kind and
//! flags inline instead, and anything else outside the table resolves to `"unknown"`.
//!
use serde::Serialize;

pub const DMU_OT_NEWTYPE: u8 = 0x80;
pub const DMU_OT_METADATA: u8 = 0x40;
pub const DMU_OT_ENCRYPTED: u8 = 0x20;
pub const DMU_OT_BYTESWAP_MASK: u8 = 0x1f;

pub const DMU_OT_NONE: u8 = 0;
pub const DMU_OT_OBJECT_DIRECTORY: u8 = 1;
pub const DMU_OT_PACKED_NVLIST: u8 = 3;
pub const DMU_OT_SPACE_MAP_HEADER: u8 = 7;
pub const DMU_OT_SPACE_MAP: u8 = 8;
pub const DMU_OT_DSL_DIR: u8 = 12;
pub const DMU_OT_DSL_DIR_CHILD_MAP: u8 = 13;
pub const DMU_OT_DSL_DS_SNAP_MAP: u8 = 14;
pub const DMU_OT_DSL_DATASET: u8 = 16;
pub const DMU_OT_ZNODE: u8 = 17;
pub const DMU_OT_PLAIN_FILE_CONTENTS: u8 = 19;
pub const DMU_OT_DIRECTORY_CONTENTS: u8 = 20;
pub const DMU_OT_MASTER_NODE: u8 = 21;
pub const DMU_OT_ZAP_OTHER: u8 = 27;
pub const DMU_OT_ERROR_LOG: u8 = 28;
pub const DMU_OT_SA: u8 = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Byteswap {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Zap,
    Dnode,
    Objset,
    Znode,
    OldAcl,
    Acl,
}

const BYTESWAP_KINDS: [Byteswap; 10] = [
    Byteswap::Uint8,
    Byteswap::Uint16,
    Byteswap::Uint32,
    Byteswap::Uint64,
    Byteswap::Zap,
    Byteswap::Dnode,
    Byteswap::Objset,
    Byteswap::Znode,
    Byteswap::OldAcl,
    Byteswap::Acl,
];

impl Byteswap {
    pub fn name(self) -> &'static str {
        match self {
            Byteswap::Uint8 => "uint8",
            Byteswap::Uint16 => "uint16",
            Byteswap::Uint32 => "uint32",
            Byteswap::Uint64 => "uint64",
            Byteswap::Zap => "zap",
            Byteswap::Dnode => "dnode",
            Byteswap::Objset => "objset",
            Byteswap::Znode => "znode",
            Byteswap::OldAcl => "oldacl",
            Byteswap::Acl => "acl",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectTypeInfo {
    pub byteswap: Byteswap,
    pub metadata: bool,
    pub encrypted: bool,
    pub name: &'static str,
}

const fn ot(byteswap: Byteswap, metadata: bool, encrypted: bool, name: &'static str) -> ObjectTypeInfo {
    ObjectTypeInfo {
        byteswap,
        metadata,
        encrypted,
        name,
    }
}

use Byteswap::{Acl, Dnode, Objset, OldAcl, Uint64, Uint8, Zap, Znode};

pub const DMU_OT: [ObjectTypeInfo; 54] = [
    ot(Uint8, true, false, "unallocated"),
    ot(Zap, true, false, "object directory"),
    ot(Uint64, true, false, "object array"),
    ot(Uint8, true, false, "packed nvlist"),
    ot(Uint64, true, false, "packed nvlist size"),
    ot(Uint64, true, false, "bpobj"),
    ot(Uint64, true, false, "bpobj header"),
    ot(Uint64, true, false, "SPA space map header"),
    ot(Uint64, true, false, "SPA space map"),
    ot(Uint64, true, true, "ZFS intent log"),
    ot(Dnode, true, true, "DMU dnode"),
    ot(Objset, true, false, "DMU objset"),
    ot(Uint64, true, false, "DSL directory"),
    ot(Zap, true, false, "DSL directory child map"),
    ot(Zap, true, false, "DSL dataset snap map"),
    ot(Zap, true, false, "DSL props"),
    ot(Uint64, true, false, "DSL dataset"),
    ot(Znode, true, false, "ZFS znode"),
    ot(OldAcl, true, true, "ZFS V0 ACL"),
    ot(Uint8, false, true, "ZFS plain file"),
    ot(Zap, true, true, "ZFS directory"),
    ot(Zap, true, false, "ZFS master node"),
    ot(Zap, true, true, "ZFS delete queue"),
    ot(Uint8, false, true, "zvol object"),
    ot(Zap, true, false, "zvol prop"),
    ot(Uint8, false, true, "other uint8[]"),
    ot(Uint64, false, true, "other uint64[]"),
    ot(Zap, true, false, "other ZAP"),
    ot(Zap, true, false, "persistent error log"),
    ot(Uint8, true, false, "SPA history"),
    ot(Uint64, true, false, "SPA history offsets"),
    ot(Zap, true, false, "Pool properties"),
    ot(Zap, true, false, "DSL permissions"),
    ot(Acl, true, true, "ZFS ACL"),
    ot(Uint8, true, true, "ZFS SYSACL"),
    ot(Uint8, true, true, "FUID table"),
    ot(Uint64, true, false, "FUID table size"),
    ot(Zap, true, false, "DSL dataset next clones"),
    ot(Zap, true, false, "scan work queue"),
    ot(Zap, true, true, "ZFS user/group/project used"),
    ot(Zap, true, true, "ZFS user/group/project quota"),
    ot(Zap, true, false, "snapshot refcount tags"),
    ot(Zap, true, false, "DDT ZAP algorithm"),
    ot(Zap, true, false, "DDT statistics"),
    ot(Uint8, true, true, "System attributes"),
    ot(Zap, true, true, "SA master node"),
    ot(Zap, true, true, "SA attr registration"),
    ot(Zap, true, true, "SA attr layouts"),
    ot(Zap, true, false, "scan translations"),
    ot(Uint8, false, true, "deduplicated block"),
    ot(Zap, true, false, "DSL deadlist map"),
    ot(Uint64, true, false, "DSL deadlist map hdr"),
    ot(Zap, true, false, "DSL dir clones"),
    ot(Uint64, true, false, "bpobj subobj"),
];

pub const DMU_OT_NUMTYPES: usize = DMU_OT.len();

fn is_newtype(code: u8) -> bool {
    code & DMU_OT_NEWTYPE != 0
}

pub fn is_valid(code: u8) -> bool {
    if is_newtype(code) {
        ((code & DMU_OT_BYTESWAP_MASK) as usize) < BYTESWAP_KINDS.len()
    } else {
        (code as usize) < DMU_OT_NUMTYPES
    }
}

pub fn byteswap(code: u8) -> Option<Byteswap> {
    if !is_valid(code) {
        None
    } else if is_newtype(code) {
        Some(BYTESWAP_KINDS[(code & DMU_OT_BYTESWAP_MASK) as usize])
    } else {
        Some(DMU_OT[code as usize].byteswap)
    }
}

/// Never fails: out-of-range codes are `"unknown"`
pub fn type_name(code: u8) -> &'static str {
    if !is_valid(code) {
        "unknown"
    } else if is_newtype(code) {
        BYTESWAP_KINDS[(code & DMU_OT_BYTESWAP_MASK) as usize].name()
    } else {
        DMU_OT[code as usize].name
    }
}

/// Same resolution for codes held in wider integers
pub fn type_name_u64(code: u64) -> &'static str {
    if code > u8::MAX as u64 {
        "unknown"
    } else {
        type_name(code as u8)
    }
}

pub fn is_metadata(code: u8) -> bool {
    if !is_valid(code) {
        false
    } else if is_newtype(code) {
        code & DMU_OT_METADATA != 0
    } else {
        DMU_OT[code as usize].metadata
    }
}

pub fn is_encrypted(code: u8) -> bool {
    if !is_valid(code) {
        false
    } else if is_newtype(code) {
        code & DMU_OT_ENCRYPTED != 0
    } else {
        DMU_OT[code as usize].encrypted
    }
}

pub fn is_zap(code: u8) -> bool {
    byteswap(code) == Some(Byteswap::Zap)
}

#[derive(Debug, Clone, Serialize)]
pub struct DmuTypeEntry {
    pub id: usize,
    pub name: &'static str,
    pub metadata: bool,
    pub encrypted: bool,
}

pub fn list_types() -> Vec<DmuTypeEntry> {
    DMU_OT
        .iter()
        .enumerate()
        .map(|(id, info)| DmuTypeEntry {
            id,
            name: info.name,
            metadata: info.metadata,
            encrypted: info.encrypted,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_codes_map_to_names() {
        assert_eq!(type_name(0), "unallocated");
        assert_eq!(type_name(DMU_OT_DSL_DIR), "DSL directory");
        assert_eq!(type_name(DMU_OT_DIRECTORY_CONTENTS), "ZFS directory");
        assert_eq!(type_name(DMU_OT_SA), "System attributes");
        assert_eq!(type_name(53), "bpobj subobj");
        for (code, info) in DMU_OT.iter().enumerate() {
            assert_eq!(type_name(code as u8), info.name);
        }
    }

    #[test]
    fn out_of_range_codes_are_unknown() {
        assert_eq!(type_name(54), "unknown");
        assert_eq!(type_name(0x7f), "unknown");
        assert_eq!(type_name(u8::MAX), "unknown");
        assert_eq!(type_name_u64(u64::MAX), "unknown");
        assert!(!is_zap(u8::MAX));
    }

    #[test]
    fn newtype_codes_resolve_through_byteswap_kind() {
        let zap = DMU_OT_NEWTYPE | DMU_OT_METADATA | 4;
        assert_eq!(type_name(zap), "zap");
        assert!(is_zap(zap));
        assert!(is_metadata(zap));
        assert!(!is_encrypted(zap));
        let data = DMU_OT_NEWTYPE | DMU_OT_ENCRYPTED;
        assert_eq!(type_name(data), "uint8");
        assert!(is_encrypted(data));
        assert!(!is_metadata(data));
        // byteswap index past the last kind
        assert_eq!(type_name(DMU_OT_NEWTYPE | 10), "unknown");
    }

    #[test]
    fn list_covers_every_type() {
        let types = list_types();
        assert_eq!(types.len(), DMU_OT_NUMTYPES);
        assert_eq!(types[19].name, "ZFS plain file");
        assert!(!types[19].metadata);
    }
}

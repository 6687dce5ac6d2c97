//!
//! Datastructures used by the ZFS Posix Layer
//!
use std::collections::HashMap;
use std::convert::TryFrom;

use nom::{number::complete as number, IResult};
use tracing::debug;

use enum_repr_derive::TryFrom;

use crate::catalog::{DMU_OT_SA, DMU_OT_ZNODE};
use crate::dmu::{DNodePhys, OsType};
use crate::store::ObjectStore;
use crate::zap_cursor::ZapCursor;
use crate::{invalid, not_found, type_mismatch, ZfsError};

pub const MASTER_NODE_OBJ: u64 = 1;
pub const ZFS_ROOT_OBJ: &str = "ROOT";
pub const ZFS_SA_ATTRS: &str = "SA_ATTRS";
const SA_REGISTRY: &str = "REGISTRY";
const SA_LAYOUTS: &str = "LAYOUTS";

/// Master node keys whose values name objects. Every other master node key holds a scalar.
pub const MASTER_NODE_REFERENCE_KEYS: [&str; 5] =
    ["ROOT", "DELETE_QUEUE", "SA_ATTRS", "FUID", "SHARES"];

pub fn is_master_node_reference(key: &str) -> bool {
    MASTER_NODE_REFERENCE_KEYS.contains(&key)
}

/// A directory entry value: type in the top 4 bits, object number in the low 48
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry(pub u64);

impl DirEntry {
    pub fn get_type(&self) -> u64 {
        self.0 >> 60
    }
    pub fn get_objnum(&self) -> u64 {
        self.0 & ((1 << 48) - 1)
    }
    pub fn new(kind: u64, obj_num: u64) -> Self {
        Self(((kind & 0xf) << 60) | (obj_num & ((1 << 48) - 1)))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFrom)]
#[repr(u64)]
pub enum DirEntryType {
    Fifo = 1,
    CharacterDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    SymLink = 10,
    Socket = 12,
    Whiteout = 14,
}

impl DirEntryType {
    pub fn name(self) -> &'static str {
        use DirEntryType::*;
        match self {
            Fifo => "fifo",
            CharacterDevice => "char",
            Directory => "dir",
            BlockDevice => "block",
            RegularFile => "file",
            SymLink => "symlink",
            Socket => "socket",
            Whiteout => "whiteout",
        }
    }
}

pub const DT_DIR: u64 = DirEntryType::Directory as u64;

pub fn dirent_type_name(kind: u64) -> &'static str {
    DirEntryType::try_from(kind)
        .ok()
        .map(DirEntryType::name)
        .unwrap_or("unknown")
}

const S_IFMT: u64 = 0o170_000;

/// Directory entry type for a POSIX mode, 0 when the format bits are not a known file type
pub fn mode_to_dirent_type(mode: u64) -> u64 {
    let fmt = (mode & S_IFMT) >> 12;
    match DirEntryType::try_from(fmt) {
        Ok(DirEntryType::Whiteout) | Err(_) => 0,
        Ok(t) => t as u64,
    }
}

/// The object set must be a filesystem for any ZPL operation
pub fn require_zpl(store: &ObjectStore<'_>) -> Result<(), ZfsError> {
    match store.objset().kind() {
        Some(OsType::ZFS) => Ok(()),
        _ => type_mismatch(format!(
            "objset is not a filesystem (type {})",
            store.objset().phys.os_type
        )),
    }
}

/// Object id of the filesystem root directory, from the master node
pub fn root_object(store: &ObjectStore<'_>) -> Result<u64, ZfsError> {
    require_zpl(store)?;
    let master = store.get_object(MASTER_NODE_OBJ)?;
    match store.zap_lookup_u64(&master, ZFS_ROOT_OBJ)? {
        Some(root) => Ok(root),
        None => not_found("master node has no ROOT entry"),
    }
}

/// Legacy bonus layout used before system attributes. The trailing ACL is not decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZNodePhys {
    pub atime: [u64; 2],
    pub mtime: [u64; 2],
    pub ctime: [u64; 2],
    pub crtime: [u64; 2],
    pub gen: u64,
    pub mode: u64,
    pub size: u64,
    pub parent: u64,
    pub links: u64,
    pub xattr: u64,
    pub rdev: u64,
    pub flags: u64,
    pub uid: u64,
    pub gid: u64,
    pub zap: u64,
}

impl ZNodePhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, times) = nom::multi::count(number::le_u64, 8)(input)?;
        let (input, (gen, mode, size, parent, links, xattr, rdev, flags, uid, gid, zap)) =
            nom::sequence::tuple((
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
            ))(input)?;
        let (input, _pad) = nom::bytes::complete::take(3 * 8usize)(input)?;
        Ok((
            input,
            Self {
                atime: [times[0], times[1]],
                mtime: [times[2], times[3]],
                ctime: [times[4], times[5]],
                crtime: [times[6], times[7]],
                gen,
                mode,
                size,
                parent,
                links,
                xattr,
                rdev,
                flags,
                uid,
                gid,
                zap,
            },
        ))
    }
}

/// Registry encoding of one attribute: number, byteswap kind and fixed length
#[derive(Debug, Clone, Copy)]
pub struct SAAttrPhys(pub u64);
impl SAAttrPhys {
    /// Length of 0 means the attribute is variable sized
    pub fn get_len(&self) -> u16 {
        ((self.0 >> 24) & ((1 << 16) - 1)) as u16
    }
    pub fn get_byteswap(&self) -> Option<SAByteswapType> {
        SAByteswapType::try_from(((self.0 >> 16) & ((1 << 8) - 1)) as u8).ok()
    }
    pub fn get_attr_num(&self) -> u16 {
        (self.0 & ((1 << 16) - 1)) as u16
    }
    pub fn new(num: u16, len: u16, byteswap: SAByteswapType) -> Self {
        Self(((len as u64) << 24) | ((byteswap as u64) << 16) | num as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFrom)]
#[repr(u8)]
pub enum SAByteswapType {
    U64Array = 0,
    U32Array = 1,
    U16Array = 2,
    U8Array = 3,
    ACL = 4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SAAttr {
    pub num: u16,
    pub name: String,
    pub length: u16,
    pub byteswap: Option<SAByteswapType>,
}

/// ZPL attributes in their default numbering, with fixed lengths (0 is variable)
const ZPL_ATTR_TABLE: [(&str, u16, SAByteswapType); 22] = [
    ("ZPL_ATIME", 16, SAByteswapType::U64Array),
    ("ZPL_MTIME", 16, SAByteswapType::U64Array),
    ("ZPL_CTIME", 16, SAByteswapType::U64Array),
    ("ZPL_CRTIME", 16, SAByteswapType::U64Array),
    ("ZPL_GEN", 8, SAByteswapType::U64Array),
    ("ZPL_MODE", 8, SAByteswapType::U64Array),
    ("ZPL_SIZE", 8, SAByteswapType::U64Array),
    ("ZPL_PARENT", 8, SAByteswapType::U64Array),
    ("ZPL_LINKS", 8, SAByteswapType::U64Array),
    ("ZPL_XATTR", 8, SAByteswapType::U64Array),
    ("ZPL_RDEV", 8, SAByteswapType::U64Array),
    ("ZPL_FLAGS", 8, SAByteswapType::U64Array),
    ("ZPL_UID", 8, SAByteswapType::U64Array),
    ("ZPL_GID", 8, SAByteswapType::U64Array),
    ("ZPL_PAD", 32, SAByteswapType::U64Array),
    ("ZPL_ZNODE_ACL", 88, SAByteswapType::U8Array),
    ("ZPL_DACL_COUNT", 8, SAByteswapType::U64Array),
    ("ZPL_SYMLINK", 0, SAByteswapType::U8Array),
    ("ZPL_SCANSTAMP", 32, SAByteswapType::U8Array),
    ("ZPL_DACL_ACES", 0, SAByteswapType::ACL),
    ("ZPL_DXATTR", 0, SAByteswapType::U8Array),
    ("ZPL_PROJID", 8, SAByteswapType::U64Array),
];

pub const SA_MAGIC: u32 = 0x2F505A;

/// System attribute header from a bonus or spill buffer
#[derive(Debug, Clone)]
pub struct SABuf {
    pub layout: u16,
    pub lengths: Vec<u16>,
    pub data: Vec<u8>,
}

impl SABuf {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (_magic, layout_info)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u32, |magic| *magic == SA_MAGIC),
            number::le_u16,
        ))(input)?;
        let header_size = ((layout_info >> 10) & ((1 << 6) - 1)) as usize * 8;
        let layout = layout_info & ((1 << 10) - 1);
        if header_size < 8 {
            return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
        }
        // magic and layout info are already consumed
        let (input, lengths) = nom::combinator::map_parser(
            nom::bytes::complete::take(header_size - (4 + 2)),
            nom::multi::many0(number::le_u16),
        )(input)?;
        let (input, data) = nom::combinator::rest(input)?;
        Ok((
            input,
            Self {
                layout,
                lengths,
                data: data.to_owned(),
            },
        ))
    }
}

/// Attribute numbering and layouts of one filesystem
#[derive(Debug, Clone, Default)]
pub struct SaRegistry {
    attrs: HashMap<u16, SAAttr>,
    layouts: HashMap<u16, Vec<u16>>,
}

impl SaRegistry {
    /// The registry a filesystem uses when it records none of its own
    pub fn default_zpl() -> Self {
        let attrs = ZPL_ATTR_TABLE
            .iter()
            .enumerate()
            .map(|(num, (name, length, byteswap))| {
                let num = num as u16;
                (
                    num,
                    SAAttr {
                        num,
                        name: name.to_string(),
                        length: *length,
                        byteswap: Some(*byteswap),
                    },
                )
            })
            .collect();
        Self {
            attrs,
            layouts: HashMap::new(),
        }
    }

    /// Read the registry and layouts reachable from the master node's `SA_ATTRS` entry
    pub fn load(store: &ObjectStore<'_>) -> Result<Self, ZfsError> {
        let mut registry = Self::default_zpl();
        let master = store.get_object(MASTER_NODE_OBJ)?;
        let sa_attrs = match store.zap_lookup_u64(&master, ZFS_SA_ATTRS)? {
            Some(obj) => obj,
            None => return Ok(registry),
        };
        let sa_dn = store.get_object(sa_attrs)?;
        if let Some(reg_obj) = store.zap_lookup_u64(&sa_dn, SA_REGISTRY)? {
            let mut cursor = ZapCursor::init(store, reg_obj)?;
            while let Some(entry) = cursor.retrieve()? {
                cursor.advance();
                let phys = match entry.single_u64() {
                    Some(v) => SAAttrPhys(v),
                    None => continue,
                };
                let num = phys.get_attr_num();
                registry.attrs.insert(
                    num,
                    SAAttr {
                        num,
                        name: entry.name(),
                        length: phys.get_len(),
                        byteswap: phys.get_byteswap(),
                    },
                );
            }
        }
        if let Some(layout_obj) = store.zap_lookup_u64(&sa_dn, SA_LAYOUTS)? {
            let mut cursor = ZapCursor::init(store, layout_obj)?;
            while let Some(entry) = cursor.retrieve()? {
                cursor.advance();
                let num = match entry.name().parse::<u16>() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                let attrs = entry
                    .value
                    .as_ref()
                    .map(|v| v.to_u64s().into_iter().map(|a| a as u16).collect())
                    .unwrap_or_default();
                registry.layouts.insert(num, attrs);
            }
        }
        debug!(
            attrs = registry.attrs.len(),
            layouts = registry.layouts.len(),
            "SA registry loaded"
        );
        Ok(registry)
    }

    pub fn insert_layout(&mut self, num: u16, attrs: Vec<u16>) {
        self.layouts.insert(num, attrs);
    }

    pub fn attr_by_name(&self, name: &str) -> Option<&SAAttr> {
        self.attrs.values().find(|a| a.name == name)
    }

    /// Split an SA buffer into its attributes, as `attribute number -> bytes`. Attributes are
    /// packed in layout order, each starting on an 8-byte boundary.
    pub fn split(&self, buf: &SABuf) -> Result<HashMap<u16, Vec<u8>>, ZfsError> {
        let layout = match self.layouts.get(&buf.layout) {
            Some(l) => l,
            None => return invalid(format!("unknown SA layout {}", buf.layout)),
        };
        let mut out = HashMap::with_capacity(layout.len());
        let mut offset = 0usize;
        let mut var_idx = 0usize;
        for num in layout {
            let fixed = self.attrs.get(num).map(|a| a.length).unwrap_or(0);
            let len = if fixed != 0 {
                fixed as usize
            } else {
                let len = match buf.lengths.get(var_idx) {
                    Some(l) => *l as usize,
                    None => return invalid("SA header has too few variable lengths"),
                };
                var_idx += 1;
                len
            };
            let end = offset.saturating_add(len);
            if end > buf.data.len() {
                return invalid(format!("SA attribute {} runs past the buffer", num));
            }
            out.insert(*num, buf.data[offset..end].to_vec());
            offset = (end + 7) & !7;
        }
        Ok(out)
    }
}

/// The POSIX attributes `stat` reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZplAttrs {
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub links: u64,
    pub parent: u64,
    pub flags: u64,
    pub gen: u64,
    pub atime: [u64; 2],
    pub mtime: [u64; 2],
    pub ctime: [u64; 2],
    pub crtime: [u64; 2],
    /// Some attribute could not be found; it reads as zero
    pub partial: bool,
}

impl From<ZNodePhys> for ZplAttrs {
    fn from(z: ZNodePhys) -> Self {
        Self {
            mode: z.mode,
            uid: z.uid,
            gid: z.gid,
            size: z.size,
            links: z.links,
            parent: z.parent,
            flags: z.flags,
            gen: z.gen,
            atime: z.atime,
            mtime: z.mtime,
            ctime: z.ctime,
            crtime: z.crtime,
            partial: false,
        }
    }
}

/// Decode the attributes of znode `objid`, from system attributes or a legacy bonus
pub fn read_attrs(store: &ObjectStore<'_>, objid: u64) -> Result<ZplAttrs, ZfsError> {
    require_zpl(store)?;
    let dn = store.get_object(objid)?;
    match dn.header.bonus_type {
        DMU_OT_SA => read_sa_attrs(store, &dn),
        DMU_OT_ZNODE => Ok(ZNodePhys::parse(&dn.bonus)?.1.into()),
        other => type_mismatch(format!(
            "object {} has bonus type {}, not a znode",
            objid, other
        )),
    }
}

fn read_sa_attrs(store: &ObjectStore<'_>, dn: &DNodePhys) -> Result<ZplAttrs, ZfsError> {
    let registry = SaRegistry::load(store)?;
    let (_, bonus) = SABuf::parse(&dn.bonus)?;
    let mut values = registry.split(&bonus)?;
    let mut partial = false;
    if let Some(spill) = &dn.spill {
        let spilled = store
            .reader()
            .resolve(spill)
            .and_then(|raw| Ok(SABuf::parse(&raw)?.1))
            .and_then(|buf| registry.split(&buf));
        match spilled {
            Ok(more) => values.extend(more),
            Err(e) => {
                debug!(error = %e, "spill block unusable");
                partial = true;
            }
        }
    }
    let mut scalar = |name: &str| -> u64 {
        let v = registry
            .attr_by_name(name)
            .and_then(|a| values.get(&a.num))
            .and_then(|b| number::le_u64::<()>(b.as_slice()).ok())
            .map(|(_, v)| v);
        partial |= v.is_none();
        v.unwrap_or(0)
    };
    let mut attrs = ZplAttrs {
        mode: scalar("ZPL_MODE"),
        uid: scalar("ZPL_UID"),
        gid: scalar("ZPL_GID"),
        size: scalar("ZPL_SIZE"),
        links: scalar("ZPL_LINKS"),
        parent: scalar("ZPL_PARENT"),
        flags: scalar("ZPL_FLAGS"),
        gen: scalar("ZPL_GEN"),
        ..ZplAttrs::default()
    };
    let mut time = |name: &str| -> [u64; 2] {
        let v = registry
            .attr_by_name(name)
            .and_then(|a| values.get(&a.num))
            .and_then(|b| {
                nom::sequence::pair(number::le_u64::<()>, number::le_u64)(b.as_slice()).ok()
            })
            .map(|(_, (sec, nsec))| [sec, nsec]);
        partial |= v.is_none();
        v.unwrap_or([0, 0])
    };
    attrs.atime = time("ZPL_ATIME");
    attrs.mtime = time("ZPL_MTIME");
    attrs.ctime = time("ZPL_CTIME");
    attrs.crtime = time("ZPL_CRTIME");
    attrs.partial = partial;
    Ok(attrs)
}

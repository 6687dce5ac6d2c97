//!
//! ZAP views: header statistics and decoded entry pages
//!
use serde::Serialize;

use crate::catalog::{is_zap, type_name, DMU_OT_DIRECTORY_CONTENTS};
use crate::limits::{zap_page, ZAP_NUMBERS_PREVIEW};
use crate::session::{PoolSession, Scope};
use crate::store::{ObjectStore, Zap};
use crate::zap::{bytes_preview, numbers_preview, ZapEntry, ZapKey, ZapResult};
use crate::zap_cursor::ZapCursor;
use crate::zpl::{dirent_type_name, is_master_node_reference, DirEntry, MASTER_NODE_OBJ};
use crate::{type_mismatch, ZfsError};

#[derive(Debug, Clone, Serialize)]
pub struct ZapInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objset_id: Option<u64>,
    pub object: u64,
    /// `microzap` or `fatzap`
    pub kind: &'static str,
    pub block_size: u64,
    pub num_blocks: u64,
    pub num_entries: u64,
    pub num_leafs: u64,
    pub ptrtbl_len: u64,
    pub ptrtbl_zt_blk: u64,
    pub ptrtbl_zt_numblks: u64,
    pub ptrtbl_zt_shift: u64,
    pub ptrtbl_blks_copied: u64,
    pub ptrtbl_nextblk: u64,
    pub zap_block_type: u64,
    pub zap_magic: u64,
    pub zap_salt: u64,
}

fn require_zap(store: &ObjectStore<'_>, obj: u64) -> Result<(), ZfsError> {
    let dn = store.get_object(obj)?;
    if !is_zap(dn.kind()) {
        return type_mismatch(format!(
            "object {} is type \"{}\" ({}), not a ZAP",
            obj,
            type_name(dn.kind()),
            dn.kind()
        ));
    }
    Ok(())
}

pub(crate) fn build_zap_info(store: &ObjectStore<'_>, obj: u64) -> Result<ZapInfo, ZfsError> {
    require_zap(store, obj)?;
    let dn = store.get_object(obj)?;
    let mut info = ZapInfo {
        objset_id: store.scope().objset_id(),
        object: obj,
        kind: "microzap",
        block_size: dn.data_block_size(),
        num_blocks: dn.header.max_block_id.saturating_add(1),
        num_entries: 0,
        num_leafs: 0,
        ptrtbl_len: 0,
        ptrtbl_zt_blk: 0,
        ptrtbl_zt_numblks: 0,
        ptrtbl_zt_shift: 0,
        ptrtbl_blks_copied: 0,
        ptrtbl_nextblk: 0,
        zap_block_type: 0,
        zap_magic: 0,
        zap_salt: 0,
    };
    match store.read_zap(&dn)? {
        Zap::Micro(m) => {
            info.num_entries = m.num_entries();
            info.zap_block_type = m.block_type;
            info.zap_salt = m.salt;
        }
        Zap::Fat(f) => {
            info.kind = "fatzap";
            info.num_entries = f.num_entries;
            info.num_leafs = f.num_leafs;
            info.ptrtbl_len = f.ptrtbl_len();
            info.ptrtbl_zt_blk = f.ptrtbl.blk;
            info.ptrtbl_zt_numblks = f.ptrtbl.numblks;
            info.ptrtbl_zt_shift = f.ptrtbl.shift;
            info.ptrtbl_blks_copied = f.ptrtbl.blk_copied;
            info.ptrtbl_nextblk = f.ptrtbl.nextblk;
            info.zap_block_type = f.block_type;
            info.zap_magic = f.magic;
            info.zap_salt = f.salt;
        }
    }
    Ok(info)
}

pub fn zap_info(session: &PoolSession, scope: Scope, obj: u64) -> Result<ZapInfo, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    build_zap_info(&store, obj)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZapEntryView {
    pub name: String,
    /// The key itself for integer keyed ZAPs
    pub key_u64: Option<u64>,
    pub integer_length: u8,
    pub num_integers: u64,
    pub value_preview: String,
    /// For a directory entry this is the object number, not the packed value
    pub value_u64: Option<u64>,
    pub raw_value_u64: Option<u64>,
    pub dirent_obj: Option<u64>,
    pub dirent_type: Option<u64>,
    pub dirent_type_name: Option<&'static str>,
    pub ref_objid: Option<u64>,
    /// A lookup of `value_u64` as an object id succeeded. This can be a coincidence.
    pub maybe_object_ref: bool,
    pub target_obj: Option<u64>,
    pub truncated: bool,
}

/// How the entries of one ZAP object are read
#[derive(Debug, Clone, Copy)]
struct EntryContext {
    dirents: bool,
    master_node: bool,
}

impl EntryContext {
    fn new(store: &ObjectStore<'_>, obj: u64, kind: u8) -> Self {
        Self {
            dirents: kind == DMU_OT_DIRECTORY_CONTENTS,
            // object 1 of a filesystem is the master node; in the MOS it is the object
            // directory, whose values all name objects
            master_node: obj == MASTER_NODE_OBJ && store.scope() != Scope::Mos,
        }
    }

    fn may_reference(&self, key: &ZapKey) -> bool {
        match key {
            ZapKey::Str(name) if self.master_node => {
                is_master_node_reference(&String::from_utf8_lossy(name))
            }
            _ => true,
        }
    }
}

fn entry_view(store: &ObjectStore<'_>, ctx: EntryContext, e: &ZapEntry) -> ZapEntryView {
    let key64 = matches!(e.key, ZapKey::Ints(_));
    let mut view = ZapEntryView {
        name: e.name(),
        key_u64: e.key.first_u64(),
        integer_length: e.int_size,
        num_integers: e.num_ints,
        value_preview: String::new(),
        value_u64: None,
        raw_value_u64: None,
        dirent_obj: None,
        dirent_type: None,
        dirent_type_name: None,
        ref_objid: None,
        maybe_object_ref: false,
        target_obj: None,
        truncated: false,
    };
    let value = match &e.value {
        Some(v) => v,
        None => {
            view.truncated = true;
            view.value_preview = String::from("(truncated)");
            return view;
        }
    };
    if e.num_ints == 0 {
        return view;
    }

    if let Some(raw) = e.single_u64() {
        let mut v = raw;
        view.raw_value_u64 = Some(raw);
        if ctx.dirents && !key64 {
            let dirent = DirEntry(raw);
            v = dirent.get_objnum();
            view.dirent_obj = Some(v);
            view.dirent_type = Some(dirent.get_type());
            view.dirent_type_name = Some(dirent_type_name(dirent.get_type()));
        }
        view.value_u64 = Some(v);
        view.ref_objid = Some(v);
        if v != 0 && ctx.may_reference(&e.key) && store.probe_reference(v) {
            view.maybe_object_ref = true;
            view.target_obj = Some(v);
        }
    }

    view.value_preview = match (value, view.dirent_type_name) {
        (ZapResult::U8(bytes), _) => bytes_preview(bytes),
        (_, Some(type_name)) => format!("{} (type: {})", view.value_u64.unwrap_or(0), type_name),
        (other, None) => numbers_preview(&other.to_u64s(), ZAP_NUMBERS_PREVIEW),
    };
    view
}

#[derive(Debug, Clone, Serialize)]
pub struct ZapEntries {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objset_id: Option<u64>,
    pub object: u64,
    pub cursor: u64,
    pub limit: u64,
    pub count: u64,
    pub next: Option<u64>,
    pub entries: Vec<ZapEntryView>,
}

pub(crate) fn build_zap_entries(
    store: &ObjectStore<'_>,
    obj: u64,
    cursor: u64,
    limit: u64,
) -> Result<ZapEntries, ZfsError> {
    require_zap(store, obj)?;
    let limit = zap_page(limit);
    let mut zc = ZapCursor::init_from_token(store, obj, cursor)?;
    let ctx = EntryContext::new(store, obj, zc.dnode().kind());
    let (entries, next) = zc.take_page(limit)?;
    let entries: Vec<ZapEntryView> = entries.iter().map(|e| entry_view(store, ctx, e)).collect();
    Ok(ZapEntries {
        objset_id: store.scope().objset_id(),
        object: obj,
        cursor,
        limit,
        count: entries.len() as u64,
        next,
        entries,
    })
}

/// One page of decoded entries of ZAP object `obj`, resuming at the token `cursor`
pub fn zap_entries(
    session: &PoolSession,
    scope: Scope,
    obj: u64,
    cursor: u64,
    limit: u64,
) -> Result<ZapEntries, ZfsError> {
    let _guard = session.read_guard();
    let store = session.store(scope)?;
    build_zap_entries(&store, obj, cursor, limit)
}

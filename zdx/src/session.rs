//!
//! An open pool: devices, the label config, the active uberblock and the MOS
//!
use std::fmt;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard};

use tracing::{debug, info};

use crate::catalog::DMU_OT_DSL_DATASET;
use crate::device::{BlockReader, Disk, RawDevice, VdevSet};
use crate::dmu::{ObjsetPhys, OsType};
use crate::dsl::{DatasetPhys, DSL_DATASET_PHYS_SIZE};
use crate::nvlist::NvList;
use crate::spa::Uberblock;
use crate::store::ObjectStore;
use crate::{not_found, precondition, type_mismatch, ZfsError};

/// Which object set an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Mos,
    /// The objset of a DSL dataset, by dataset object id
    Dataset(u64),
}

impl Scope {
    pub fn objset_id(&self) -> Option<u64> {
        match self {
            Scope::Mos => None,
            Scope::Dataset(id) => Some(*id),
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Mos => "mos",
            Scope::Dataset(_) => "objset",
        }
    }
}

/// A decoded object set and the scope it was reached through
#[derive(Debug, Clone)]
pub struct Objset {
    pub scope: Scope,
    pub phys: ObjsetPhys,
}

impl Objset {
    pub fn kind(&self) -> Option<OsType> {
        self.phys.kind()
    }
}

pub struct PoolSession {
    name: String,
    config: NvList,
    uberblock: Uberblock,
    mos: Objset,
    reader: Box<dyn BlockReader + Send + Sync>,
    lock: RwLock<()>,
}

impl fmt::Debug for PoolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSession")
            .field("name", &self.name)
            .field("txg", &self.uberblock.txg)
            .finish()
    }
}

impl PoolSession {
    /// Open the pool whose top-level vdevs are `vdevs`, in vdev id order. Each entry lists the
    /// children of one top-level vdev: one path for a plain disk, several for a mirror.
    pub fn open<P: AsRef<Path>>(name: Option<&str>, vdevs: &[Vec<P>]) -> Result<Self, ZfsError> {
        if vdevs.is_empty() || vdevs.iter().any(|v| v.is_empty()) {
            return precondition("at least one device per top-level vdev is required");
        }
        let mut disks = Vec::with_capacity(vdevs.len());
        for children in vdevs {
            let mut opened = Vec::with_capacity(children.len());
            for path in children {
                debug!(path = %path.as_ref().display(), "opening device");
                opened.push(Disk::new(path)?);
            }
            disks.push(opened);
        }
        Self::open_devices(name, VdevSet::from_vdevs(disks))
    }

    /// Open a pool over already opened devices
    pub fn open_devices<D>(name: Option<&str>, vdevs: VdevSet<D>) -> Result<Self, ZfsError>
    where
        D: RawDevice + Send + Sync + 'static,
    {
        let mut best: Option<(NvList, Uberblock)> = None;
        let mut last_err = None;
        for (vdev, dev) in vdevs.devices() {
            for label_num in 0..2 {
                let label = match dev.read_label(label_num) {
                    Ok(l) => l,
                    Err(e) => {
                        debug!(vdev, label_num, error = %e, "label unreadable");
                        last_err = Some(e);
                        continue;
                    }
                };
                let ub = match label.active_uberblock() {
                    Some(ub) => ub.clone(),
                    None => continue,
                };
                let newer = best.as_ref().map_or(true, |(_, b)| {
                    (ub.txg, ub.timestamp) > (b.txg, b.timestamp)
                });
                if newer {
                    best = Some((label.config, ub));
                }
            }
        }
        let (config, uberblock) = match (best, last_err) {
            (Some(b), _) => b,
            (None, Some(e)) => return Err(e),
            (None, None) => return not_found("no valid uberblock on any label"),
        };
        let pool_name = config.get_str("name").unwrap_or_default().to_string();
        if let Some(wanted) = name {
            if wanted != pool_name {
                return precondition(format!(
                    "devices belong to pool {:?}, not {:?}",
                    pool_name, wanted
                ));
            }
        }
        Self::from_parts(pool_name, config, uberblock, Box::new(vdevs))
    }

    /// Assemble a session from its decoded parts, reading the MOS from the uberblock
    pub fn from_parts(
        name: String,
        config: NvList,
        uberblock: Uberblock,
        reader: Box<dyn BlockReader + Send + Sync>,
    ) -> Result<Self, ZfsError> {
        if uberblock.rootbp.is_hole() {
            return not_found("uberblock has no root block pointer");
        }
        let raw = reader.resolve(&uberblock.rootbp)?;
        let (_, phys) = ObjsetPhys::parse(&raw)?;
        info!(pool = %name, txg = uberblock.txg, "pool opened");
        Ok(Self {
            name,
            config,
            uberblock,
            mos: Objset {
                scope: Scope::Mos,
                phys,
            },
            reader,
            lock: RwLock::new(()),
        })
    }

    /// Release the devices
    pub fn close(self) {
        debug!(pool = %self.name, "pool closed");
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn config(&self) -> &NvList {
        &self.config
    }
    pub fn uberblock(&self) -> &Uberblock {
        &self.uberblock
    }
    pub fn reader(&self) -> &dyn BlockReader {
        self.reader.as_ref()
    }
    pub fn mos(&self) -> &Objset {
        &self.mos
    }

    /// Held for the duration of every public operation
    pub fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        // the guarded value is `()`, so a poisoned lock carries no torn state
        self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mos_store(&self) -> ObjectStore<'_> {
        ObjectStore::new(self.reader(), self.mos.clone())
    }

    pub fn store(&self, scope: Scope) -> Result<ObjectStore<'_>, ZfsError> {
        Ok(ObjectStore::new(self.reader(), self.objset(scope)?))
    }

    /// Resolve `scope` to its object set. A dataset scope goes through the dataset's bonus.
    pub fn objset(&self, scope: Scope) -> Result<Objset, ZfsError> {
        let dsobj = match scope {
            Scope::Mos => return Ok(self.mos.clone()),
            Scope::Dataset(id) => id,
        };
        if dsobj == 0 {
            return precondition("dataset object id must be non-zero");
        }
        let ds = self.dataset(dsobj)?;
        if ds.bp.is_hole() {
            return not_found(format!("dataset {} has no objset", dsobj));
        }
        let raw = self.reader.resolve(&ds.bp)?;
        let (_, phys) = ObjsetPhys::parse(&raw)?;
        Ok(Objset { scope, phys })
    }

    /// The DSL dataset bonus of MOS object `dsobj`
    pub fn dataset(&self, dsobj: u64) -> Result<DatasetPhys, ZfsError> {
        let dn = self.mos_store().get_dnode(dsobj)?;
        if dn.header.bonus_type != DMU_OT_DSL_DATASET
            || dn.bonus.len() < DSL_DATASET_PHYS_SIZE
        {
            return type_mismatch(format!("object {} is not a DSL dataset", dsobj));
        }
        let (_, ds) = DatasetPhys::parse(&dn.bonus)?;
        Ok(ds)
    }
}

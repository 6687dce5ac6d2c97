//!
//! Leaf devices and block pointer resolution
//!
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fs::File;
use std::io::Result as IoResult;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::compression::decompress;
use crate::fletcher::{Fletcher2, Fletcher4};
use crate::spa::{
    BlockPtr, BlockPtrKind, Checksum, ChecksumType, Label, ZioGbh, DVA, LABEL_SIZE, VDEV_DATA_OFFSET,
    ZIO_GANG_HEADER_SIZE,
};
use crate::{ZfsError, ZfsErrorKind};

/// Gang headers nest at most this deep before the pointer is treated as corrupt
const GANG_DEPTH_MAX: u32 = 4;

#[derive(Debug)]
pub struct Disk {
    path: PathBuf,
    file: File,
}

impl Disk {
    pub fn new<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let f = File::open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: f,
        })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn read(&self, address: u64, len: u64) -> IoResult<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        (&self.file).seek(SeekFrom::Start(address))?;
        (&self.file).read_exact(&mut buf)?;
        Ok(buf)
    }
}

pub trait RawDevice {
    type Block: AsRef<[u8]>;
    /// Read the requested amount, given in bytes
    fn read_raw(&self, addr: u64, size: u64) -> IoResult<Self::Block>;

    /// Labels 0 and 1 sit at the front of the device
    fn read_label(&self, label_num: u8) -> Result<Label, ZfsError> {
        if label_num > 1 {
            return Err(ZfsErrorKind::UnsupportedFeature(format!("label {}", label_num)).into());
        }
        let raw = self.read_raw(label_num as u64 * LABEL_SIZE, LABEL_SIZE)?;
        Ok(Label::parse(raw.as_ref())?.1)
    }
}

impl RawDevice for Disk {
    type Block = Vec<u8>;
    fn read_raw(&self, addr: u64, size: u64) -> IoResult<Self::Block> {
        self.read(addr, size)
    }
}

/// Physical reads by top-level vdev id, plus block pointer resolution on top of them
pub trait BlockReader {
    /// Read `size` bytes at `offset` within the allocatable area of top-level vdev `vdev`
    fn read_raw(&self, vdev: u64, offset: u64, size: u64) -> Result<Vec<u8>, ZfsError>;

    fn has_vdev(&self, vdev: u64) -> bool;

    fn read_dva(&self, dva: &DVA, size: u64) -> Result<Vec<u8>, ZfsError> {
        self.read_raw(dva.vdev as u64, dva.offset_bytes(), size)
    }

    /// Logical contents of the block `ptr` points at: `lsize` bytes, verified and decompressed
    fn resolve(&self, ptr: &BlockPtr) -> Result<Vec<u8>, ZfsError> {
        resolve_at_depth(self, ptr, 0)
    }
}

fn resolve_at_depth<R: BlockReader + ?Sized>(
    reader: &R,
    ptr: &BlockPtr,
    depth: u32,
) -> Result<Vec<u8>, ZfsError> {
    let lsize = ptr.lsize() as usize;
    if ptr.encryption {
        return Err(ZfsErrorKind::UnsupportedFeature("encrypted block".into()).into());
    }
    let ptrdata = match &ptr.embedded {
        BlockPtrKind::Data { data, .. } => return decompress(ptr.compression, data, lsize),
        BlockPtrKind::Ptr(p) => p,
    };
    if ptr.is_hole() {
        return Ok(vec![0; lsize]);
    }
    if !ptr.byteorder {
        return Err(ZfsErrorKind::UnsupportedFeature("big-endian block".into()).into());
    }
    let psize = ptrdata.physical_size;
    let mut last_err: Option<ZfsError> = None;
    for dva in ptrdata.addresses.iter().filter(|d| d.is_valid()) {
        let physical = if dva.gang {
            read_gang(reader, dva, psize, depth)
        } else {
            reader.read_dva(dva, psize)
        };
        let physical = match physical.and_then(|data| verify(ptr, data)) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    vdev = dva.vdev,
                    offset = dva.offset_bytes(),
                    error = %e,
                    "block copy unusable, trying next copy"
                );
                last_err = Some(e);
                continue;
            }
        };
        trace!(vdev = dva.vdev, offset = dva.offset_bytes(), psize, lsize, "block read");
        return decompress(ptr.compression, &physical, lsize);
    }
    Err(last_err.unwrap_or_else(|| {
        ZfsErrorKind::Invalid("block pointer has no valid addresses".into()).into()
    }))
}

/// Reassemble a ganged block from the children listed in its header
fn read_gang<R: BlockReader + ?Sized>(
    reader: &R,
    dva: &DVA,
    psize: u64,
    depth: u32,
) -> Result<Vec<u8>, ZfsError> {
    if depth >= GANG_DEPTH_MAX {
        return Err(ZfsErrorKind::Invalid("gang headers nested too deep".into()).into());
    }
    let header = reader.read_dva(dva, ZIO_GANG_HEADER_SIZE as u64)?;
    let (_, gbh) = ZioGbh::parse(&header)?;
    let mut out = Vec::with_capacity(psize as usize);
    for child in gbh.blkptr.iter().filter(|bp| !bp.is_hole()) {
        if out.len() as u64 >= psize {
            break;
        }
        out.extend(resolve_at_depth(reader, child, depth + 1)?);
    }
    debug!(
        vdev = dva.vdev,
        offset = dva.offset_bytes(),
        len = out.len(),
        "gang block reassembled"
    );
    out.resize(psize as usize, 0);
    Ok(out)
}

fn verify(ptr: &BlockPtr, data: Vec<u8>) -> Result<Vec<u8>, ZfsError> {
    let ptrdata = match ptr.ptr() {
        Some(p) => p,
        None => return Ok(data),
    };
    let computed: Checksum = match ChecksumType::try_from(ptrdata.checksum_type) {
        Ok(ChecksumType::Fletcher2) => Fletcher2::parse(&data)?.1.into(),
        Ok(ChecksumType::On) | Ok(ChecksumType::Fletcher4) => Fletcher4::parse(&data)?.1.into(),
        other => {
            trace!(checksum = ?other, "checksum not verified");
            return Ok(data);
        }
    };
    if ptrdata.checksum == computed {
        Ok(data)
    } else {
        Err(ZfsErrorKind::Checksum.into())
    }
}

/// Top-level vdevs by id. A vdev with several children is a mirror: reads fall through
/// children in order until one succeeds.
pub struct VdevSet<D> {
    vdevs: BTreeMap<u64, Vec<D>>,
}

impl<D: RawDevice> VdevSet<D> {
    pub fn new() -> Self {
        Self {
            vdevs: BTreeMap::new(),
        }
    }
    /// Top-level vdevs in id order, each a list of mirror children
    pub fn from_vdevs(vdevs: Vec<Vec<D>>) -> Self {
        Self {
            vdevs: vdevs
                .into_iter()
                .enumerate()
                .map(|(id, children)| (id as u64, children))
                .collect(),
        }
    }
    pub fn insert(&mut self, id: u64, children: Vec<D>) {
        self.vdevs.insert(id, children);
    }
    pub fn devices(&self) -> impl Iterator<Item = (u64, &D)> {
        self.vdevs
            .iter()
            .flat_map(|(id, children)| children.iter().map(move |d| (*id, d)))
    }
    pub fn len(&self) -> usize {
        self.vdevs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.vdevs.is_empty()
    }
}

impl<D: RawDevice> Default for VdevSet<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RawDevice> BlockReader for VdevSet<D> {
    fn read_raw(&self, vdev: u64, offset: u64, size: u64) -> Result<Vec<u8>, ZfsError> {
        let children = match self.vdevs.get(&vdev) {
            Some(c) if !c.is_empty() => c,
            _ => return Err(ZfsErrorKind::NotFound(format!("vdev {} not present", vdev)).into()),
        };
        let addr = offset
            .checked_add(VDEV_DATA_OFFSET)
            .ok_or_else(|| ZfsErrorKind::Invalid(format!("offset {:#x} overflows", offset)))?;
        let mut last_err = None;
        for (child, dev) in children.iter().enumerate() {
            match dev.read_raw(addr, size) {
                Ok(block) => return Ok(block.as_ref().to_vec()),
                Err(e) => {
                    debug!(vdev, child, offset, size, error = %e, "mirror child read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(ZfsError::from)
            .unwrap_or_else(|| ZfsErrorKind::NotFound(format!("vdev {}", vdev)).into()))
    }

    fn has_vdev(&self, vdev: u64) -> bool {
        self.vdevs.get(&vdev).map_or(false, |c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{encode_blkptr, BlockWriter, BpSpec, MemDisk};
    use crate::ErrorClass;

    fn parse_bp(spec: &BpSpec) -> BlockPtr {
        BlockPtr::parse(&encode_blkptr(spec)).expect("128 bytes").1
    }

    #[test]
    fn resolves_and_verifies_a_plain_block() {
        let mut w = BlockWriter::new();
        let spec = w.write(0, 10, 0, &[0x5a; 1024]);
        let vdevs = w.into_vdevs();
        let data = vdevs.resolve(&parse_bp(&spec)).expect("readable");
        assert_eq!(data, vec![0x5a; 1024]);
    }

    #[test]
    fn falls_back_to_second_copy_on_checksum_mismatch() {
        let mut w = BlockWriter::new();
        let good = w.write(0, 10, 0, &[1u8; 512]);
        let bad = w.write(0, 10, 0, &[2u8; 512]);
        let mut spec = good.clone();
        // first copy holds other bytes, second copy the real ones
        spec.dvas = vec![bad.dvas[0], good.dvas[0]];
        let vdevs = w.into_vdevs();
        let data = vdevs.resolve(&parse_bp(&spec)).expect("second copy");
        assert_eq!(data, vec![1u8; 512]);
    }

    #[test]
    fn all_copies_bad_is_a_checksum_error() {
        let mut w = BlockWriter::new();
        let mut spec = w.write(0, 10, 0, &[1u8; 512]);
        spec.checksum_words = [1, 2, 3, 4];
        let vdevs = w.into_vdevs();
        let err = vdevs.resolve(&parse_bp(&spec)).unwrap_err();
        assert!(matches!(err.kind(), ZfsErrorKind::Checksum));
        assert_eq!(err.class(), ErrorClass::Io);
    }

    #[test]
    fn holes_read_as_zeroes() {
        let vdevs: VdevSet<MemDisk> = VdevSet::new();
        let spec = BpSpec {
            lsize: 4096,
            dvas: vec![],
            ..BpSpec::default()
        };
        assert_eq!(vdevs.resolve(&parse_bp(&spec)).expect("hole"), vec![0; 4096]);
    }

    #[test]
    fn mirror_reads_fall_through_children() {
        let short = MemDisk::new(vec![0; 16]);
        let mut full = vec![0u8; (VDEV_DATA_OFFSET + 4096) as usize];
        full[VDEV_DATA_OFFSET as usize] = 0xee;
        let mut vdevs = VdevSet::new();
        vdevs.insert(0, vec![short, MemDisk::new(full)]);
        let data = vdevs.read_raw(0, 0, 512).expect("second child");
        assert_eq!(data[0], 0xee);
    }

    #[test]
    fn unknown_vdev_is_not_found() {
        let vdevs: VdevSet<MemDisk> = VdevSet::new();
        assert!(vdevs.read_raw(3, 0, 512).unwrap_err().is_not_found());
        assert!(!vdevs.has_vdev(3));
    }

    #[test]
    fn gang_blocks_are_reassembled() {
        let mut w = BlockWriter::new();
        let a = w.write(0, 19, 0, &[0xaa; 512]);
        let b = w.write(0, 19, 0, &[0xbb; 512]);
        let mut whole = vec![0xaa; 512];
        whole.extend_from_slice(&[0xbb; 512]);
        let spec = w.write_gang(&[a, b], &whole);
        let vdevs = w.into_vdevs();
        let data = vdevs.resolve(&parse_bp(&spec)).expect("gang");
        assert_eq!(&data[..512], &[0xaa; 512][..]);
        assert_eq!(&data[512..], &[0xbb; 512][..]);
    }
}

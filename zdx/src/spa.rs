//!
//! Datastructures used by the Storage Pool Allocator
//!
use std::convert::TryFrom;
use std::fmt;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::fletcher::{Fletcher2, Fletcher4};
use crate::nvlist::NvList;

pub const UBERBLOCK_MAGIC: u64 = 0x00ba_b10c;
pub const LABEL_SIZE: u64 = 256 * 1024;
/// Two labels and the boot block precede the allocatable area of a leaf vdev
pub const VDEV_DATA_OFFSET: u64 = 0x40_0000;
pub const BLKPTR_SIZE: usize = 128;

const UBERBLOCK_SHIFT_MIN: u64 = 10;
const UBERBLOCK_SHIFT_MAX: u64 = 13;
const UBERBLOCK_RING: usize = 128 * 1024;

#[derive(Debug, Clone)]
pub struct Label {
    pub config: NvList,
    pub uberblocks: Vec<Uberblock>,
}

impl Label {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (_pad, _boot_header, nv_pairs, ring)) = nom::sequence::tuple((
            nom::bytes::complete::take(8 * 1024usize),
            nom::bytes::complete::take(8 * 1024usize),
            nom::bytes::complete::take(112 * 1024usize),
            nom::bytes::complete::take(UBERBLOCK_RING),
        ))(input)?;
        let (_, config) = NvList::unpack(nv_pairs)?;
        // slot size follows the top-level vdev's ashift
        let ashift = config
            .get_nvlist("vdev_tree")
            .and_then(|tree| tree.get_u64("ashift"))
            .unwrap_or(9);
        let shift = ashift.max(UBERBLOCK_SHIFT_MIN).min(UBERBLOCK_SHIFT_MAX);
        let uberblock_size = 1usize << shift;
        let (_, uberblocks) = nom::multi::count(
            |i| Uberblock::parse(i, uberblock_size),
            UBERBLOCK_RING / uberblock_size,
        )(ring)?;
        Ok((input, Self { config, uberblocks }))
    }

    /// The uberblock with the highest txg among those carrying a valid magic
    pub fn active_uberblock(&self) -> Option<&Uberblock> {
        self.uberblocks
            .iter()
            .filter(|u| u.is_valid())
            .max_by_key(|u| (u.txg, u.timestamp))
    }
}

#[derive(Debug, Clone)]
pub struct Uberblock {
    pub magic: u64,
    pub version: u64,
    pub txg: u64,
    pub guid_sum: u64,
    pub timestamp: u64,
    pub rootbp: BlockPtr,
    pub software_version: u64,
    pub mmp_magic: u64,
    pub mmp_delay: u64,
    pub mmp_config: u64,
    pub checkpoint_txg: u64,
}

impl Uberblock {
    pub fn parse(input: &[u8], size: usize) -> IResult<&[u8], Self> {
        let (input, block) = nom::bytes::complete::take(size)(input)?;
        let (
            _block,
            (
                magic,
                version,
                txg,
                guid_sum,
                timestamp,
                rootbp,
                software_version,
                mmp_magic,
                mmp_delay,
                mmp_config,
                checkpoint_txg,
            ),
        ) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            BlockPtr::parse,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(block)?;
        Ok((
            input,
            Self {
                magic,
                version,
                txg,
                guid_sum,
                timestamp,
                rootbp,
                software_version,
                mmp_magic,
                mmp_delay,
                mmp_config,
                checkpoint_txg,
            },
        ))
    }

    pub fn is_valid(&self) -> bool {
        self.magic == UBERBLOCK_MAGIC && self.txg != 0
    }
}

#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct DVA {
    pub vdev: u32,
    pub grid: u8,
    /// In 512-byte sectors
    pub asize: u32,
    /// In 512-byte sectors, relative to the start of the allocatable area
    pub offset: u64,
    pub gang: bool,
}

impl fmt::Debug for DVA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DVA")
            .field("vdev", &self.vdev)
            .field("grid", &self.grid)
            .field("asize", &self.asize)
            .field("offset", &format!("{:x}", self.offset << 9))
            .field("gang", &self.gang)
            .finish()
    }
}

impl DVA {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (asize, grid, vdev)) =
            nom::sequence::tuple((number::le_u24, number::le_u8, number::le_u32))(input)?;
        let (input, offset_gang) = number::le_u64(input)?;
        let gang = offset_gang & (1 << 63) != 0;
        let offset = offset_gang & ((1 << 63) - 1);
        Ok((
            input,
            Self {
                vdev,
                grid,
                asize,
                offset,
                gang,
            },
        ))
    }
    pub fn is_valid(&self) -> bool {
        self.asize != 0
    }
    pub fn is_empty(&self) -> bool {
        *self == DVA::default()
    }
    pub fn offset_bytes(&self) -> u64 {
        self.offset << 9
    }
    pub fn asize_bytes(&self) -> u64 {
        (self.asize as u64) << 9
    }
}

#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct Checksum {
    pub checksum: [u64; 4],
}

impl From<Fletcher4> for Checksum {
    fn from(f: Fletcher4) -> Self {
        Self {
            checksum: [f.a, f.b, f.c, f.d],
        }
    }
}

impl From<Fletcher2> for Checksum {
    fn from(f: Fletcher2) -> Self {
        Self {
            checksum: [f.a0, f.a1, f.b0, f.b1],
        }
    }
}

impl Checksum {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (c1, c2, c3, c4)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                checksum: [c1, c2, c3, c4],
            },
        ))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, TryFrom, Eq, PartialEq)]
pub enum CompressionType {
    Inherit = 0,
    On = 1,
    Off = 2,
    LZJB = 3,
    Empty = 4,
    GZIP1 = 5,
    GZIP2 = 6,
    GZIP3 = 7,
    GZIP4 = 8,
    GZIP5 = 9,
    GZIP6 = 10,
    GZIP7 = 11,
    GZIP8 = 12,
    GZIP9 = 13,
    ZLE = 14,
    LZ4 = 15,
    ZSTD = 16,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, TryFrom, Eq, PartialEq)]
pub enum ChecksumType {
    Inherit = 0,
    On = 1,
    Off = 2,
    Label = 3,
    GangHeader = 4,
    ZILog = 5,
    Fletcher2 = 6,
    Fletcher4 = 7,
    SHA256 = 8,
    ZILog2 = 9,
    NoParity = 10,
    SHA512 = 11,
    Skein = 12,
    Edonr = 13,
    Blake3 = 14,
}

/// A decoded `blkptr_t`. Unknown algorithm and type codes are kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPtr {
    pub embedded: BlockPtrKind,
    pub byteorder: bool,
    pub dedup: bool,
    pub encryption: bool,
    /// DMU object type of the block contents
    pub kind: u8,
    pub compression: u8,
    pub indirection_level: u8,
    /// In bytes
    pub logical_size: u64,
    pub logical_transaction: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPtrPtr {
    pub addresses: [DVA; 3],
    /// In bytes
    pub physical_size: u64,
    pub physical_transaction: u64,
    pub checksum_type: u8,
    pub fill_count: u64,
    pub checksum: Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPtrKind {
    Ptr(BlockPtrPtr),
    Data { embedded_type: u8, data: Vec<u8> },
}

const fn bits(word: u64, shift: u32, len: u32) -> u64 {
    (word >> shift) & ((1 << len) - 1)
}

impl BlockPtr {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, raw) = nom::bytes::complete::take(BLKPTR_SIZE)(input)?;
        let (_, words) = nom::multi::count(number::le_u64, 16)(raw)?;
        let prop = words[6];
        let embedded_data = bits(prop, 39, 1) != 0;
        let compression = bits(prop, 32, 7) as u8;
        let kind = bits(prop, 48, 8) as u8;
        let indirection_level = bits(prop, 56, 5) as u8;
        let encryption = bits(prop, 61, 1) != 0;
        let dedup = bits(prop, 62, 1) != 0;
        let byteorder = bits(prop, 63, 1) != 0;
        let logical_transaction = words[10];
        let (embedded, logical_size) = if embedded_data {
            // payload lives in every word except prop (6) and the birth txg (10)
            let payload_size = bits(prop, 25, 7) as usize + 1;
            let mut data = Vec::with_capacity(112);
            data.extend_from_slice(&raw[..48]);
            data.extend_from_slice(&raw[56..80]);
            data.extend_from_slice(&raw[88..]);
            data.truncate(payload_size);
            (
                BlockPtrKind::Data {
                    embedded_type: bits(prop, 40, 8) as u8,
                    data,
                },
                bits(prop, 0, 25) + 1,
            )
        } else {
            let (_, (a1, a2, a3)) =
                nom::sequence::tuple((DVA::parse, DVA::parse, DVA::parse))(raw)?;
            let (_, checksum) = Checksum::parse(&raw[96..])?;
            (
                BlockPtrKind::Ptr(BlockPtrPtr {
                    addresses: [a1, a2, a3],
                    physical_size: (bits(prop, 16, 16) + 1) << 9,
                    physical_transaction: words[9],
                    checksum_type: bits(prop, 40, 8) as u8,
                    fill_count: words[11],
                    checksum,
                }),
                (bits(prop, 0, 16) + 1) << 9,
            )
        };
        Ok((
            input,
            Self {
                embedded,
                byteorder,
                dedup,
                encryption,
                kind,
                compression,
                indirection_level,
                logical_size,
                logical_transaction,
            },
        ))
    }

    pub fn parse_array(input: &[u8], count: usize) -> IResult<&[u8], Vec<Self>> {
        nom::multi::count(BlockPtr::parse, count)(input)
    }

    pub fn ptr(&self) -> Option<&BlockPtrPtr> {
        match &self.embedded {
            BlockPtrKind::Ptr(p) => Some(p),
            BlockPtrKind::Data { .. } => None,
        }
    }
    pub fn is_embedded(&self) -> bool {
        self.ptr().is_none()
    }
    /// Deliberate absence of data, not an error
    pub fn is_hole(&self) -> bool {
        self.ptr().map_or(false, |p| p.addresses[0].is_empty())
    }
    pub fn is_gang(&self) -> bool {
        self.ptr().map_or(false, |p| p.addresses[0].gang)
    }
    /// Device addresses that actually point somewhere
    pub fn dvas(&self) -> impl Iterator<Item = &DVA> {
        self.ptr()
            .into_iter()
            .flat_map(|p| p.addresses.iter())
            .filter(|d| d.is_valid())
    }
    pub fn ndvas(&self) -> usize {
        self.dvas().count()
    }
    pub fn lsize(&self) -> u64 {
        self.logical_size
    }
    /// Zero for embedded pointers
    pub fn psize(&self) -> u64 {
        self.ptr().map_or(0, |p| p.physical_size)
    }
    pub fn asize(&self) -> u64 {
        self.ptr().map_or(0, |p| {
            p.addresses.iter().map(|d| d.asize_bytes()).sum::<u64>()
        })
    }
    pub fn fill(&self) -> u64 {
        self.ptr().map_or(1, |p| p.fill_count)
    }
    pub fn logical_birth(&self) -> u64 {
        self.logical_transaction
    }
    pub fn physical_birth(&self) -> u64 {
        match self.ptr() {
            Some(p) if p.physical_transaction != 0 => p.physical_transaction,
            Some(_) => self.logical_transaction,
            None => 0,
        }
    }
    pub fn birth_txg(&self) -> u64 {
        if self.is_embedded() {
            self.logical_transaction
        } else {
            self.physical_birth()
        }
    }
    /// Checksum algorithm, or the embedded payload type for embedded pointers
    pub fn checksum_code(&self) -> u8 {
        match &self.embedded {
            BlockPtrKind::Ptr(p) => p.checksum_type,
            BlockPtrKind::Data { embedded_type, .. } => *embedded_type,
        }
    }
    pub fn compression_type(&self) -> Option<CompressionType> {
        CompressionType::try_from(self.compression).ok()
    }
}

pub const ZIO_GANG_HEADER_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct ZioGbh {
    pub blkptr: [BlockPtr; 3],
    pub tail: ZioBlockTail,
}

impl ZioGbh {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (b0, b1, b2, _pad, tail)) = nom::sequence::tuple((
            BlockPtr::parse,
            BlockPtr::parse,
            BlockPtr::parse,
            nom::bytes::complete::take(ZIO_GANG_HEADER_SIZE - (BLKPTR_SIZE * 3) - (5 * 8)),
            ZioBlockTail::parse,
        ))(input)?;
        Ok((
            input,
            Self {
                blkptr: [b0, b1, b2],
                tail,
            },
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZioBlockTail {
    pub magic: u64,
    pub checksum: Checksum,
}

impl ZioBlockTail {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (magic, checksum)) =
            nom::sequence::tuple((number::le_u64, Checksum::parse))(input)?;
        Ok((input, Self { magic, checksum }))
    }
}

//!
//! Datastructures used by the Data Management Unit
//!
use std::convert::TryFrom;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::spa::{BlockPtr, BLKPTR_SIZE};

pub const DNODE_SHIFT: u64 = 9;
pub const DNODE_SIZE: usize = 1 << DNODE_SHIFT;
pub const DNODE_HEADER_SIZE: usize = 64;
/// Intent log header between the meta dnode and the objset type
const ZIL_HEADER_SIZE: usize = 192;
pub const SPA_BLKPTRSHIFT: u8 = 7;
pub const DN_MAX_INDBLKSHIFT: u8 = 17;

pub const DNODE_FLAG_USED_BYTES: u8 = 1 << 0;
pub const DNODE_FLAG_USERUSED_ACCOUNTED: u8 = 1 << 1;
pub const DNODE_FLAG_SPILL_BLKPTR: u8 = 1 << 2;
pub const DNODE_FLAG_USEROBJUSED_ACCOUNTED: u8 = 1 << 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DNodePhysHeader {
    pub kind: u8,
    pub indirect_block_shift: u8,
    pub levels: u8,
    pub num_block_ptr: u8,
    pub bonus_type: u8,
    pub checksum: u8,
    pub compress: u8,
    pub flags: u8,
    /// Data block size in 512-byte sectors
    pub datablkszsec: u16,
    pub bonus_len: u16,
    /// Additional 512-byte slots consumed by a large dnode
    pub extra_slots: u8,
    pub max_block_id: u64,
    /// Bytes or sectors, depending on `DNODE_FLAG_USED_BYTES`
    pub sec_phys: u64,
}

impl DNodePhysHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (kind, indirect_block_shift, levels, num_block_ptr, bonus_type, checksum, compress, flags),
        ) = nom::sequence::tuple((
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
        ))(input)?;
        let (input, (datablkszsec, bonus_len, extra_slots)) =
            nom::sequence::tuple((number::le_u16, number::le_u16, number::le_u8))(input)?;
        let (input, _pad) = nom::bytes::complete::take(3usize)(input)?;
        let (input, (max_block_id, sec_phys)) =
            nom::sequence::tuple((number::le_u64, number::le_u64))(input)?;
        let (input, _pad) = nom::bytes::complete::take(4 * 8usize)(input)?;
        Ok((
            input,
            Self {
                kind,
                indirect_block_shift,
                levels,
                num_block_ptr,
                bonus_type,
                checksum,
                compress,
                flags,
                datablkszsec,
                bonus_len,
                extra_slots,
                max_block_id,
                sec_phys,
            },
        ))
    }

    pub fn dnode_size(&self) -> usize {
        (self.extra_slots as usize + 1) * DNODE_SIZE
    }
    pub fn has_spill(&self) -> bool {
        self.flags & DNODE_FLAG_SPILL_BLKPTR != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DNodePhys {
    pub header: DNodePhysHeader,
    pub block_pointers: Vec<BlockPtr>,
    pub bonus: Vec<u8>,
    pub spill: Option<BlockPtr>,
}

impl DNodePhys {
    /// Parses one dnode, which may span several 512-byte slots
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (_, header) = nom::combinator::peek(DNodePhysHeader::parse)(input)?;
        let size = header.dnode_size();
        nom::combinator::map_parser(nom::bytes::complete::take(size), move |slot: &[u8]| {
            let (input, header) = DNodePhysHeader::parse(slot)?;
            let (input, block_pointers) =
                BlockPtr::parse_array(input, header.num_block_ptr as usize)?;
            let spill_size = if header.has_spill() { BLKPTR_SIZE } else { 0 };
            let bonus_room = input.len().saturating_sub(spill_size);
            if header.bonus_len as usize > bonus_room {
                return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
            }
            let (_, bonus) = nom::bytes::complete::take(header.bonus_len as usize)(input)?;
            let spill = if header.has_spill() {
                Some(BlockPtr::parse(&slot[size - BLKPTR_SIZE..])?.1)
            } else {
                None
            };
            Ok((
                &slot[size..],
                Self {
                    header,
                    block_pointers,
                    bonus: bonus.to_vec(),
                    spill,
                },
            ))
        })(input)
    }

    pub fn kind(&self) -> u8 {
        self.header.kind
    }
    pub fn data_block_size(&self) -> u64 {
        self.header.datablkszsec as u64 * 512
    }
    pub fn indirect_block_size(&self) -> u64 {
        1u64 << self.header.indirect_block_shift.min(63)
    }
    /// Block pointers held by one indirect block
    pub fn pointers_per_indirect(&self) -> u64 {
        1u64 << self.header.indirect_block_shift.saturating_sub(SPA_BLKPTRSHIFT).min(63)
    }
    pub fn used_bytes(&self) -> u64 {
        if self.header.flags & DNODE_FLAG_USED_BYTES != 0 {
            self.header.sec_phys
        } else {
            self.header.sec_phys.saturating_mul(512)
        }
    }
    pub fn physical_blocks_512(&self) -> u64 {
        self.used_bytes().saturating_add(256) >> 9
    }
    pub fn max_offset(&self) -> u64 {
        (self.header.max_block_id.saturating_add(1)).saturating_mul(self.data_block_size())
    }
    pub fn fill_count(&self) -> u64 {
        self.block_pointers
            .iter()
            .fold(0u64, |acc, bp| acc.saturating_add(bp.fill()))
    }
    pub fn dnode_size(&self) -> usize {
        self.header.dnode_size()
    }
}

#[derive(Debug, Clone)]
pub struct ObjsetPhys {
    pub metadnode: DNodePhys,
    pub os_type: u64,
    pub os_flags: u64,
}

impl ObjsetPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (metadnode, _zil_header, os_type, os_flags)) = nom::combinator::map_parser(
            nom::bytes::complete::take(1024usize),
            nom::sequence::tuple((
                DNodePhys::parse,
                nom::bytes::complete::take(ZIL_HEADER_SIZE),
                number::le_u64,
                number::le_u64,
            )),
        )(input)?;
        Ok((
            input,
            Self {
                metadnode,
                os_type,
                os_flags,
            },
        ))
    }

    pub fn kind(&self) -> Option<OsType> {
        OsType::try_from(self.os_type).ok()
    }
    /// Dnodes held by one block of the meta dnode
    pub fn dnodes_per_block(&self) -> u64 {
        (self.metadnode.data_block_size() >> DNODE_SHIFT).max(1)
    }
}

#[derive(Debug, Clone, Copy, TryFrom, PartialEq, Eq)]
#[repr(u64)]
pub enum OsType {
    NONE = 0,
    META = 1,
    ZFS = 2,
    ZVOL = 3,
}

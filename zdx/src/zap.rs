//!
//! ZFS Attribute Processor: the on-disk key/value maps behind directories, properties and most
//! MOS bookkeeping
//!
use std::convert::TryFrom;
use std::fmt;

use nom::{number::complete as number, IResult};

use crc::{Algorithm, Crc};

pub const ZBT_LEAF: u64 = (1 << 63) + 0;
pub const ZBT_HEADER: u64 = (1 << 63) + 1;
pub const ZBT_MICRO: u64 = (1 << 63) + 3;
pub const ZAP_MAGIC: u64 = 0x2_F52A_B2AB;

pub const ZAP_FLAG_HASH64: u64 = 1 << 0;
pub const ZAP_FLAG_UINT64_KEY: u64 = 1 << 1;
pub const ZAP_FLAG_PRE_HASHED_KEY: u64 = 1 << 2;

pub const MZAP_ENT_LEN: usize = 64;
pub const MZAP_NAME_LEN: usize = MZAP_ENT_LEN - 8 - 4 - 2;
const MZAP_HEADER_LEN: usize = 64;

const ZAP_HASHBITS: u32 = 28;
const ZAP_HASHBITS_64: u32 = 48;

const ZFS_CRC64: Algorithm<u64> = Algorithm {
    width: 64,
    poly: 0x42f0_e1eb_a9ea_3693,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0,
    residue: 0,
};

static ZAP_CRC: Crc<u64> = Crc::<u64>::new(&ZFS_CRC64);

/// Keep the top `hashbits` bits, leaving the rest free for the collision differentiator
fn mask_hash(h: u64, hashbits: u32) -> u64 {
    if hashbits >= 64 {
        h
    } else {
        h & !((1u64 << (64 - hashbits)) - 1)
    }
}

/// Hash of a string key. The terminating NUL is not hashed.
pub fn zap_hash(salt: u64, key: &[u8], hashbits: u32) -> u64 {
    let mut digest = ZAP_CRC.digest_with_initial(salt.reverse_bits());
    digest.update(key);
    mask_hash(digest.finalize(), hashbits)
}

/// Hash of an integer key, fed through the CRC least significant byte first
pub fn zap_hash_u64(salt: u64, key: &[u64], hashbits: u32) -> u64 {
    let mut digest = ZAP_CRC.digest_with_initial(salt.reverse_bits());
    for word in key {
        digest.update(&word.to_le_bytes());
    }
    mask_hash(digest.finalize(), hashbits)
}

pub fn zap_hash_idx(hash: u64, shift: u64) -> u64 {
    if shift > 0 && shift < 64 {
        hash >> (64 - shift)
    } else {
        0
    }
}

/// Largest collision differentiator a map with `hashbits` can hold, exclusive
pub fn zap_maxcd(hashbits: u32) -> u64 {
    1u64 << (64 - hashbits)
}

/// An integer array value. Fat ZAP leaves store integers big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZapResult {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl ZapResult {
    pub fn parse(input: &[u8], int_size: u8) -> Option<ZapResult> {
        match int_size {
            1 => Some(ZapResult::U8(input.to_owned())),
            2 => nom::combinator::all_consuming::<_, _, (), _>(nom::multi::many0(number::be_u16))(
                input,
            )
            .ok()
            .map(|o| ZapResult::U16(o.1)),
            4 => nom::combinator::all_consuming::<_, _, (), _>(nom::multi::many0(number::be_u32))(
                input,
            )
            .ok()
            .map(|o| ZapResult::U32(o.1)),
            8 => nom::combinator::all_consuming::<_, _, (), _>(nom::multi::many0(number::be_u64))(
                input,
            )
            .ok()
            .map(|o| ZapResult::U64(o.1)),
            _ => None,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            ZapResult::U8(v) => v.len(),
            ZapResult::U16(v) => v.len(),
            ZapResult::U32(v) => v.len(),
            ZapResult::U64(v) => v.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The value when it is exactly one 8-byte integer
    pub fn single_u64(&self) -> Option<u64> {
        match self {
            ZapResult::U64(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
    pub fn to_u64s(&self) -> Vec<u64> {
        match self {
            ZapResult::U8(v) => v.iter().map(|x| *x as u64).collect(),
            ZapResult::U16(v) => v.iter().map(|x| *x as u64).collect(),
            ZapResult::U32(v) => v.iter().map(|x| *x as u64).collect(),
            ZapResult::U64(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZapKey {
    Str(Vec<u8>),
    Ints(Vec<u64>),
}

impl ZapKey {
    pub fn first_u64(&self) -> Option<u64> {
        match self {
            ZapKey::Ints(v) => v.first().copied(),
            ZapKey::Str(_) => None,
        }
    }
    /// String keys as text, integer keys as `0x` and 16 hex digits
    pub fn display(&self) -> String {
        match self {
            ZapKey::Str(s) => String::from_utf8_lossy(s).into_owned(),
            ZapKey::Ints(v) => format!("0x{:016x}", v.first().copied().unwrap_or(0)),
        }
    }
}

/// One decoded entry of either ZAP flavour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapEntry {
    pub key: ZapKey,
    pub hash: u64,
    pub cd: u32,
    pub int_size: u8,
    pub num_ints: u64,
    /// `None` when the value was too large to materialize
    pub value: Option<ZapResult>,
}

impl ZapEntry {
    pub fn name(&self) -> String {
        self.key.display()
    }
    pub fn value_bytes(&self) -> u64 {
        (self.int_size as u64).saturating_mul(self.num_ints)
    }
    pub fn single_u64(&self) -> Option<u64> {
        if self.int_size == 8 && self.num_ints == 1 {
            self.value.as_ref().and_then(ZapResult::single_u64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum ZapBlock {
    MicroZap(MZapPhys),
    FatHeader(ZapPhys),
    FatLeaf(ZapLeafPhys),
}

impl ZapBlock {
    /// block_size in bytes
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        nom::branch::alt((
            nom::combinator::map(|i| MZapPhys::parse(i, block_size), Self::MicroZap),
            nom::combinator::map(|i| ZapPhys::parse(i, block_size), Self::FatHeader),
            nom::combinator::map(|i| ZapLeafPhys::parse(i, block_size), Self::FatLeaf),
        ))(input)
    }
}

#[derive(Debug, Clone)]
pub struct MZapPhys {
    pub block_type: u64,
    pub salt: u64,
    pub normflags: u64,
    pub entries: Vec<MZapEntryPhys>,
}

impl MZapPhys {
    /// block_size in bytes
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let chunks = (block_size / MZAP_ENT_LEN).saturating_sub(1);
        let (input, (block_type, salt, normflags, _pad, entries)) = nom::combinator::map_parser(
            nom::bytes::complete::take(block_size),
            nom::sequence::tuple((
                nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_MICRO),
                number::le_u64,
                number::le_u64,
                nom::bytes::complete::take(MZAP_HEADER_LEN - 3 * 8),
                nom::multi::count(MZapEntryPhys::parse, chunks),
            )),
        )(input)?;
        Ok((
            input,
            Self {
                block_type,
                salt,
                normflags,
                entries,
            },
        ))
    }
    pub fn lookup(&self, key: &[u8]) -> Option<&MZapEntryPhys> {
        if key.len() >= MZAP_NAME_LEN {
            // names are NUL terminated within the chunk
            return None;
        }
        self.entries
            .iter()
            .find(|entry| !entry.is_empty() && entry.name_bytes() == key)
    }
    /// In-use chunks as `(chunk index, entry)`
    pub fn live_entries(&self) -> impl Iterator<Item = (usize, &MZapEntryPhys)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.is_empty())
    }
    pub fn num_entries(&self) -> u64 {
        self.live_entries().count() as u64
    }
    pub fn entry(&self, chunk: usize) -> Option<ZapEntry> {
        let e = self.entries.get(chunk).filter(|e| !e.is_empty())?;
        Some(e.to_entry(self.salt))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct MZapEntryPhys {
    pub value: u64,
    pub cd: u32,
    pub name: Vec<u8>,
}

impl MZapEntryPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (value, cd, _pad, name)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u32,
            nom::bytes::complete::take(2usize),
            nom::bytes::complete::take(MZAP_NAME_LEN),
        ))(input)?;
        Ok((
            input,
            Self {
                value,
                cd,
                name: name.to_vec(),
            },
        ))
    }
    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }
    pub fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|c| *c == 0).unwrap_or(self.name.len());
        &self.name[..end]
    }
    pub fn hash(&self, salt: u64) -> u64 {
        zap_hash(salt, self.name_bytes(), ZAP_HASHBITS)
    }
    fn to_entry(&self, salt: u64) -> ZapEntry {
        ZapEntry {
            key: ZapKey::Str(self.name_bytes().to_vec()),
            hash: self.hash(salt),
            cd: self.cd,
            int_size: 8,
            num_ints: 1,
            value: Some(ZapResult::U64(vec![self.value])),
        }
    }
}

impl fmt::Debug for MZapEntryPhys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MZapEntryPhys")
            .field("value", &self.value)
            .field("cd", &self.cd)
            .field("name", &String::from_utf8_lossy(self.name_bytes()))
            .finish()
    }
}

#[derive(Clone)]
pub struct ZapPhys {
    pub block_type: u64,
    pub magic: u64,
    pub ptrtbl: ZapTablePhys,
    pub freeblk: u64,
    pub num_leafs: u64,
    pub num_entries: u64,
    pub salt: u64,
    pub normflags: u64,
    pub flags: u64,
    /// Embedded pointer table in the second half of the header block
    pub leafs: Vec<u64>,
}

impl fmt::Debug for ZapPhys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZapPhys")
            .field("block_type", &self.block_type)
            .field("magic", &self.magic)
            .field("ptrtbl", &self.ptrtbl)
            .field("freeblk", &self.freeblk)
            .field("num_leafs", &self.num_leafs)
            .field("num_entries", &self.num_entries)
            .field("salt", &self.salt)
            .field("flags", &self.flags)
            .field("leafs", &self.leafs.len())
            .finish()
    }
}

const ZAP_HEADER_FIELDS: usize = 15 * 8;

impl ZapPhys {
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let half = block_size / 2;
        if half < ZAP_HEADER_FIELDS {
            return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
        }
        let (
            input,
            (block_type, magic, ptrtbl, freeblk, num_leafs, num_entries, salt, normflags, flags),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_HEADER),
            number::le_u64,
            ZapTablePhys::parse,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        let (input, (_pad, leafs)) = nom::sequence::tuple((
            nom::bytes::complete::take(half - ZAP_HEADER_FIELDS),
            nom::multi::count(number::le_u64, half / 8),
        ))(input)?;
        Ok((
            input,
            Self {
                block_type,
                magic,
                ptrtbl,
                freeblk,
                num_leafs,
                num_entries,
                salt,
                normflags,
                flags,
                leafs,
            },
        ))
    }
    pub fn hashbits(&self) -> u32 {
        if self.flags & ZAP_FLAG_HASH64 != 0 {
            ZAP_HASHBITS_64
        } else {
            ZAP_HASHBITS
        }
    }
    pub fn uint64_keys(&self) -> bool {
        self.flags & ZAP_FLAG_UINT64_KEY != 0
    }
    pub fn pre_hashed(&self) -> bool {
        self.flags & ZAP_FLAG_PRE_HASHED_KEY != 0
    }
    pub fn embedded_ptrtbl(&self) -> bool {
        self.ptrtbl.blk == 0
    }
    pub fn ptrtbl_len(&self) -> u64 {
        1u64 << self.ptrtbl.shift.min(63)
    }
    pub fn hash_str(&self, key: &[u8]) -> u64 {
        zap_hash(self.salt, key, self.hashbits())
    }
    pub fn hash_ints(&self, key: &[u64]) -> u64 {
        if self.pre_hashed() {
            return mask_hash(key.first().copied().unwrap_or(0), self.hashbits());
        }
        zap_hash_u64(self.salt, key, self.hashbits())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZapTablePhys {
    /// First block of an external pointer table, zero when embedded
    pub blk: u64,
    pub numblks: u64,
    pub shift: u64,
    pub nextblk: u64,
    pub blk_copied: u64,
}

impl ZapTablePhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (blk, numblks, shift, nextblk, blk_copied)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                blk,
                numblks,
                shift,
                nextblk,
                blk_copied,
            },
        ))
    }
}

const ZAP_LEAF_CHUNKSIZE: usize = 24;
const ZAP_LEAF_ARRAY_BYTES: usize = ZAP_LEAF_CHUNKSIZE - 3;
const ZAP_LEAF_HEADER_SIZE: usize = 48;
pub const ZAP_CHAIN_END: u16 = 0xffff;

pub const fn zap_leaf_hash_numentries(block_size: usize) -> usize {
    block_size / 32
}

pub const fn zap_leaf_numchunks(block_size: usize) -> usize {
    ((block_size - (2 * zap_leaf_hash_numentries(block_size))) / ZAP_LEAF_CHUNKSIZE) - 2
}

// take the hash_shift bits following prefix_len bits
// 0 0 0 0 0 0 0 1 1 1 1 1 0 0 ....
// | prefix_len | hash_shift |
//                ^ take these
fn leaf_hash_idx(hash: u64, hash_shift: u32, prefix_len: u16) -> u64 {
    let drop = 64u32.saturating_sub(hash_shift + prefix_len as u32);
    let shifted = if drop >= 64 { 0 } else { hash >> drop };
    shifted & ((1u64 << hash_shift) - 1)
}

#[derive(Debug, Clone)]
pub struct ZapLeafPhys {
    pub hdr: ZapLeafHeader,
    pub hash: Vec<u16>,
    pub chunks: Vec<ZapLeafChunk>,
}

impl ZapLeafPhys {
    /// block_size in bytes
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        if block_size < ZAP_LEAF_HEADER_SIZE * 4 {
            return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
        }
        let (input, hdr) = ZapLeafHeader::parse(input)?;
        let (input, hash) =
            nom::multi::count(number::le_u16, zap_leaf_hash_numentries(block_size))(input)?;
        let (input, chunks) =
            nom::multi::count(ZapLeafChunk::parse, zap_leaf_numchunks(block_size))(input)?;
        Ok((input, Self { hdr, hash, chunks }))
    }

    /// Find `key` within this leaf by following the hash bucket's chain
    pub fn lookup(&self, key: &ZapKey, hash: u64) -> Option<ZapEntry> {
        let hash_shift = self.hash.len().trailing_zeros();
        let bucket = leaf_hash_idx(hash, hash_shift, self.hdr.prefix_len) as usize;
        let mut chunk = *self.hash.get(bucket)?;
        // a chain can never be longer than the leaf
        for _ in 0..self.chunks.len() {
            if chunk == ZAP_CHAIN_END {
                return None;
            }
            let entry = self.chunks.get(chunk as usize)?.entry_ref()?;
            if entry.hash == hash {
                if let Some(found) = self.decode_entry(entry, key_is_ints(key), usize::MAX) {
                    if &found.key == key {
                        return Some(found);
                    }
                }
            }
            chunk = entry.next;
        }
        None
    }

    /// `(hash, cd, chunk index)` of every entry in the leaf
    pub fn entry_positions(&self) -> Vec<(u64, u32, u16)> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.entry_ref().map(|e| (e.hash, e.cd, idx as u16)))
            .collect()
    }

    /// Decode the entry at `chunk`; values over `value_cap` bytes are left unmaterialized
    pub fn entry_at(&self, chunk: u16, int_keys: bool, value_cap: usize) -> Option<ZapEntry> {
        let entry = self.chunks.get(chunk as usize)?.entry_ref()?;
        self.decode_entry(entry, int_keys, value_cap)
    }

    fn decode_entry(&self, entry: &ZapLeafEntry, int_keys: bool, value_cap: usize) -> Option<ZapEntry> {
        let key = if int_keys {
            let raw = self.get_array(entry.name_chunk, entry.name_length as usize * 8)?;
            match ZapResult::parse(&raw, 8)? {
                ZapResult::U64(v) => ZapKey::Ints(v),
                _ => return None,
            }
        } else {
            // exclude the terminating null
            let len = (entry.name_length as usize).saturating_sub(1);
            ZapKey::Str(self.get_array(entry.name_chunk, len)?)
        };
        let value_len = entry.int_size as usize * entry.value_length as usize;
        let value = if value_len > value_cap {
            None
        } else {
            let raw = self.get_array(entry.value_chunk, value_len)?;
            Some(ZapResult::parse(&raw, entry.int_size)?)
        };
        Some(ZapEntry {
            key,
            hash: entry.hash,
            cd: entry.cd,
            int_size: entry.int_size,
            num_ints: entry.value_length as u64,
            value,
        })
    }

    fn get_array(&self, mut array_idx: u16, length: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(length.min(self.chunks.len() * ZAP_LEAF_ARRAY_BYTES));
        for _ in 0..self.chunks.len() {
            if out.len() >= length {
                break;
            }
            let a = match self.chunks.get(array_idx as usize)? {
                ZapLeafChunk::Array(a) => a,
                _ => return None,
            };
            out.extend_from_slice(&a.array);
            if a.next == ZAP_CHAIN_END {
                break;
            }
            array_idx = a.next;
        }
        if out.len() < length {
            return None;
        }
        out.truncate(length);
        Some(out)
    }
}

fn key_is_ints(key: &ZapKey) -> bool {
    matches!(key, ZapKey::Ints(_))
}

#[derive(Debug, Clone)]
pub struct ZapLeafHeader {
    pub block_type: u64,
    pub prefix: u64,
    pub magic: u32,
    pub nfree: u16,
    pub nentries: u16,
    pub prefix_len: u16,
    pub freelist: u16,
    pub flags: u8,
}

impl ZapLeafHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (block_type, _next, prefix, magic, nfree, nentries, prefix_len, freelist, flags, _pad),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_LEAF),
            number::le_u64,
            number::le_u64,
            number::le_u32,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u8,
            nom::bytes::complete::take(11usize),
        ))(input)?;
        Ok((
            input,
            Self {
                block_type,
                prefix,
                magic,
                nfree,
                nentries,
                prefix_len,
                freelist,
                flags,
            },
        ))
    }
}

const ZAP_LEAF_ENTRY: u8 = 252;
const ZAP_LEAF_ARRAY: u8 = 251;
const ZAP_LEAF_FREE: u8 = 253;

#[derive(Debug, Clone)]
pub enum ZapLeafChunk {
    Entry(ZapLeafEntry),
    Array(ZapLeafArray),
    Free(ZapLeafFree),
}

impl ZapLeafChunk {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::branch::alt((ZapLeafEntry::parse, ZapLeafArray::parse, ZapLeafFree::parse))(input)
    }
    pub fn entry_ref(&self) -> Option<&ZapLeafEntry> {
        match self {
            ZapLeafChunk::Entry(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafEntry {
    pub int_size: u8,
    /// Next entry chunk in the same hash bucket
    pub next: u16,
    pub name_chunk: u16,
    /// In integers, including the NUL of string keys
    pub name_length: u16,
    pub value_chunk: u16,
    pub value_length: u16,
    pub cd: u32,
    pub hash: u64,
}

impl ZapLeafEntry {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (
            input,
            (_kind, int_size, next, name_chunk, name_length, value_chunk, value_length, cd, hash),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_ENTRY),
            number::le_u8,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u32,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            ZapLeafChunk::Entry(Self {
                int_size,
                next,
                name_chunk,
                name_length,
                value_chunk,
                value_length,
                cd,
                hash,
            }),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafArray {
    pub array: [u8; ZAP_LEAF_ARRAY_BYTES],
    pub next: u16,
}

impl ZapLeafArray {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (input, (_kind, array, next)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_ARRAY),
            nom::combinator::map_res(nom::bytes::complete::take(ZAP_LEAF_ARRAY_BYTES), |a| {
                <[u8; ZAP_LEAF_ARRAY_BYTES]>::try_from(a)
            }),
            number::le_u16,
        ))(input)?;
        Ok((input, ZapLeafChunk::Array(Self { array, next })))
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafFree {
    pub next: u16,
}

impl ZapLeafFree {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (input, (_kind, _pad, next)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_FREE),
            nom::bytes::complete::take(ZAP_LEAF_ARRAY_BYTES),
            number::le_u16,
        ))(input)?;
        Ok((input, ZapLeafChunk::Free(Self { next })))
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

fn is_print(b: u8) -> bool {
    (0x20..=0x7e).contains(&b)
}

/// Byte values render as text when every byte is printable or whitespace, tolerating one
/// trailing NUL. Anything else renders as hex over the whole array.
pub fn bytes_preview(bytes: &[u8]) -> String {
    let text = match bytes.split_last() {
        Some((0, rest)) => rest,
        _ => bytes,
    };
    if text.iter().all(|b| is_print(*b) || is_space(*b)) {
        String::from_utf8_lossy(text).into_owned()
    } else {
        crate::hex_string(bytes)
    }
}

/// The first few integers separated by spaces, with `...` when more remain
pub fn numbers_preview(values: &[u64], max: usize) -> String {
    let mut out = values
        .iter()
        .take(max)
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if values.len() > max {
        out.push_str(" ...");
    }
    out
}

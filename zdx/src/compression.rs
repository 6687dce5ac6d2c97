use std::convert::TryFrom;

use nom::combinator::map_res;
use nom::multi::length_data;
use nom::number::complete::be_u32;
use nom::IResult;

use crate::spa::CompressionType;
use crate::{ZfsError, ZfsErrorKind};

pub fn decompress_lz4(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(length_data(be_u32), lz4_compression::decompress::decompress)(input)
}

const LZJB_MATCH_BITS: u32 = 6;
const LZJB_MATCH_MIN: usize = 3;
const LZJB_OFFSET_MASK: usize = (1 << (16 - LZJB_MATCH_BITS)) - 1;

/// Decompress an LZJB stream into exactly `out_len` bytes
pub fn decompress_lzjb(input: &[u8], out_len: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(out_len);
    let mut src = input.iter().copied();
    let mut copymap = 0u8;
    let mut copymask = 1u16 << 7;
    while out.len() < out_len {
        copymask <<= 1;
        if copymask == 1 << 8 {
            copymask = 1;
            copymap = src.next()?;
        }
        if copymap as u16 & copymask != 0 {
            let hi = src.next()? as usize;
            let lo = src.next()? as usize;
            let mut mlen = (hi >> (8 - LZJB_MATCH_BITS)) + LZJB_MATCH_MIN;
            let offset = ((hi << 8) | lo) & LZJB_OFFSET_MASK;
            if offset == 0 || offset > out.len() {
                return None;
            }
            mlen = mlen.min(out_len - out.len());
            let mut cpy = out.len() - offset;
            for _ in 0..mlen {
                let b = out[cpy];
                out.push(b);
                cpy += 1;
            }
        } else {
            out.push(src.next()?);
        }
    }
    Some(out)
}

/// Turn the physical bytes of a block into `lsize` logical bytes
pub fn decompress(code: u8, data: &[u8], lsize: usize) -> Result<Vec<u8>, ZfsError> {
    let kind = CompressionType::try_from(code).map_err(|_| {
        ZfsErrorKind::UnsupportedFeature(format!("compression algorithm {}", code))
    })?;
    let mut out = match kind {
        CompressionType::Off | CompressionType::Inherit => data.to_vec(),
        CompressionType::Empty => vec![0; lsize],
        CompressionType::LZ4 | CompressionType::On => decompress_lz4(data)?.1,
        CompressionType::LZJB => decompress_lzjb(data, lsize)
            .ok_or_else(|| ZfsErrorKind::Invalid("corrupt lzjb stream".into()))?,
        other => {
            return Err(ZfsErrorKind::UnsupportedFeature(format!(
                "compression algorithm {:?}",
                other
            ))
            .into())
        }
    };
    out.resize(lsize, 0);
    Ok(out)
}

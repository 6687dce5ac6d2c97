//!
//! Fletcher checksums as block pointers record them: running sums over little-endian words
//!
use nom::error::ErrorKind;
use nom::IResult;

/// Split off the whole `width`-byte words of `input`, failing on a ragged tail
fn whole_words(input: &[u8], width: usize) -> IResult<&[u8], &[u8]> {
    let tail = input.len() % width;
    if tail != 0 {
        return Err(nom::Err::Error((&input[input.len() - tail..], ErrorKind::Eof)));
    }
    Ok((&input[input.len()..], input))
}

fn le_u32(word: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(word);
    u32::from_le_bytes(b)
}

fn le_u64(word: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(word);
    u64::from_le_bytes(b)
}

/// Four cascaded sums over 32-bit words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fletcher4 {
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

impl Fletcher4 {
    pub fn update(&mut self, word: u32) {
        self.a = self.a.wrapping_add(u64::from(word));
        self.b = self.b.wrapping_add(self.a);
        self.c = self.c.wrapping_add(self.b);
        self.d = self.d.wrapping_add(self.c);
    }

    /// Checksum of `input`, which must be a whole number of 32-bit words
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (rest, words) = whole_words(input, 4)?;
        let sum = words.chunks_exact(4).fold(Self::default(), |mut f, w| {
            f.update(le_u32(w));
            f
        });
        Ok((rest, sum))
    }
}

/// Two interleaved lanes of 64-bit words, each with a running sum and a sum of sums
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fletcher2 {
    pub a0: u64,
    pub a1: u64,
    pub b0: u64,
    pub b1: u64,
}

impl Fletcher2 {
    pub fn update(&mut self, even: u64, odd: u64) {
        self.a0 = self.a0.wrapping_add(even);
        self.a1 = self.a1.wrapping_add(odd);
        self.b0 = self.b0.wrapping_add(self.a0);
        self.b1 = self.b1.wrapping_add(self.a1);
    }

    /// Checksum of `input`, which must be a whole number of 16-byte word pairs
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (rest, pairs) = whole_words(input, 16)?;
        let sum = pairs.chunks_exact(16).fold(Self::default(), |mut f, p| {
            f.update(le_u64(&p[..8]), le_u64(&p[8..]));
            f
        });
        Ok((rest, sum))
    }
}

//!
//! XDR encoded name/value lists, as found in vdev labels and packed nvlist objects
//!
use nom::{number::complete as number, IResult};
use serde_json::{Map, Value};

const NV_ENCODE_XDR: u8 = 1;

const DATA_TYPE_BOOLEAN: u32 = 1;
const DATA_TYPE_BYTE: u32 = 2;
const DATA_TYPE_INT16: u32 = 3;
const DATA_TYPE_UINT16: u32 = 4;
const DATA_TYPE_INT32: u32 = 5;
const DATA_TYPE_UINT32: u32 = 6;
const DATA_TYPE_INT64: u32 = 7;
const DATA_TYPE_UINT64: u32 = 8;
const DATA_TYPE_STRING: u32 = 9;
const DATA_TYPE_BYTE_ARRAY: u32 = 10;
const DATA_TYPE_INT16_ARRAY: u32 = 11;
const DATA_TYPE_UINT16_ARRAY: u32 = 12;
const DATA_TYPE_INT32_ARRAY: u32 = 13;
const DATA_TYPE_UINT32_ARRAY: u32 = 14;
const DATA_TYPE_INT64_ARRAY: u32 = 15;
const DATA_TYPE_UINT64_ARRAY: u32 = 16;
const DATA_TYPE_STRING_ARRAY: u32 = 17;
const DATA_TYPE_HRTIME: u32 = 18;
const DATA_TYPE_NVLIST: u32 = 19;
const DATA_TYPE_NVLIST_ARRAY: u32 = 20;
const DATA_TYPE_BOOLEAN_VALUE: u32 = 21;
const DATA_TYPE_INT8: u32 = 22;
const DATA_TYPE_UINT8: u32 = 23;
const DATA_TYPE_BOOLEAN_ARRAY: u32 = 24;
const DATA_TYPE_INT8_ARRAY: u32 = 25;
const DATA_TYPE_UINT8_ARRAY: u32 = 26;
const DATA_TYPE_DOUBLE: u32 = 27;

#[derive(Debug, Clone, PartialEq)]
pub enum NvValue {
    /// Presence-only flag
    Boolean,
    BooleanValue(bool),
    Int(i64),
    Uint(u64),
    Hrtime(i64),
    String(String),
    ByteArray(Vec<u8>),
    IntArray(Vec<i64>),
    UintArray(Vec<u64>),
    BooleanArray(Vec<bool>),
    StringArray(Vec<String>),
    NvList(NvList),
    NvListArray(Vec<NvList>),
    Double(f64),
    /// A pair type this decoder does not know, skipped using its encoded size
    Unknown(u32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvList {
    pub version: i32,
    pub flags: u32,
    pub pairs: Vec<(String, NvValue)>,
}

fn xdr_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, bytes) = nom::multi::length_data(number::be_u32)(input)?;
    let (input, _pad) = nom::bytes::complete::take((4 - bytes.len() % 4) % 4)(input)?;
    Ok((input, String::from_utf8_lossy(bytes).into_owned()))
}

fn xdr_opaque(input: &[u8], len: usize) -> IResult<&[u8], Vec<u8>> {
    let (input, bytes) = nom::bytes::complete::take(len)(input)?;
    let (input, _pad) = nom::bytes::complete::take((4 - len % 4) % 4)(input)?;
    Ok((input, bytes.to_vec()))
}

/// Arrays of scalars carry their own element count ahead of the elements
fn xdr_array<'a, O, F>(input: &'a [u8], elem: F) -> IResult<&'a [u8], Vec<O>>
where
    F: Fn(&'a [u8]) -> IResult<&'a [u8], O>,
{
    let (input, n) = number::be_u32(input)?;
    nom::multi::count(elem, n as usize)(input)
}

fn xdr_i32(input: &[u8]) -> IResult<&[u8], i64> {
    nom::combinator::map(number::be_i32, i64::from)(input)
}

fn xdr_u32(input: &[u8]) -> IResult<&[u8], u64> {
    nom::combinator::map(number::be_u32, u64::from)(input)
}

fn xdr_bool(input: &[u8]) -> IResult<&[u8], bool> {
    nom::combinator::map(number::be_u32, |v| v != 0)(input)
}

impl NvList {
    /// Decode a packed nvlist: a 4 byte stream header followed by the list itself
    pub fn unpack(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (_encoding, _endian, _reserved)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |e| *e == NV_ENCODE_XDR),
            number::le_u8,
            nom::bytes::complete::take(2usize),
        ))(input)?;
        Self::parse(input)
    }

    /// Decode an XDR nvlist body (version, flags, pairs, terminator)
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (mut input, (version, flags)) =
            nom::sequence::tuple((number::be_i32, number::be_u32))(input)?;
        let mut pairs = Vec::new();
        loop {
            let (rest, (encoded_size, decoded_size)) =
                nom::combinator::peek(nom::sequence::tuple((number::be_u32, number::be_u32)))(
                    input,
                )?;
            if encoded_size == 0 && decoded_size == 0 {
                input = &rest[8..];
                break;
            }
            if encoded_size < 8 {
                return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
            }
            let (rest, pair) = nom::bytes::complete::take(encoded_size as usize)(input)?;
            let (_, (name, value)) = Self::parse_pair(&pair[8..])?;
            pairs.push((name, value));
            input = rest;
        }
        Ok((
            input,
            Self {
                version,
                flags,
                pairs,
            },
        ))
    }

    fn parse_pair(input: &[u8]) -> IResult<&[u8], (String, NvValue)> {
        let (input, (name, kind, nelem)) =
            nom::sequence::tuple((xdr_string, number::be_u32, number::be_u32))(input)?;
        let nelem = nelem as usize;
        let (input, value) = match kind {
            DATA_TYPE_BOOLEAN => (input, NvValue::Boolean),
            DATA_TYPE_BOOLEAN_VALUE => nom::combinator::map(xdr_bool, NvValue::BooleanValue)(input)?,
            DATA_TYPE_BYTE | DATA_TYPE_UINT8 | DATA_TYPE_UINT16 | DATA_TYPE_UINT32 => {
                nom::combinator::map(xdr_u32, NvValue::Uint)(input)?
            }
            DATA_TYPE_INT8 | DATA_TYPE_INT16 | DATA_TYPE_INT32 => {
                nom::combinator::map(xdr_i32, NvValue::Int)(input)?
            }
            DATA_TYPE_INT64 => {
                nom::combinator::map(number::be_i64, NvValue::Int)(input)?
            }
            DATA_TYPE_UINT64 => {
                nom::combinator::map(number::be_u64, NvValue::Uint)(input)?
            }
            DATA_TYPE_HRTIME => {
                nom::combinator::map(number::be_i64, NvValue::Hrtime)(input)?
            }
            DATA_TYPE_DOUBLE => nom::combinator::map(number::be_f64, NvValue::Double)(input)?,
            DATA_TYPE_STRING => nom::combinator::map(xdr_string, NvValue::String)(input)?,
            DATA_TYPE_BYTE_ARRAY => {
                nom::combinator::map(|i| xdr_opaque(i, nelem), NvValue::ByteArray)(input)?
            }
            DATA_TYPE_INT8_ARRAY | DATA_TYPE_INT16_ARRAY | DATA_TYPE_INT32_ARRAY => {
                nom::combinator::map(|i| xdr_array(i, xdr_i32), NvValue::IntArray)(input)?
            }
            DATA_TYPE_UINT8_ARRAY | DATA_TYPE_UINT16_ARRAY | DATA_TYPE_UINT32_ARRAY => {
                nom::combinator::map(|i| xdr_array(i, xdr_u32), NvValue::UintArray)(input)?
            }
            DATA_TYPE_INT64_ARRAY => nom::combinator::map(
                |i| xdr_array(i, number::be_i64),
                NvValue::IntArray,
            )(input)?,
            DATA_TYPE_UINT64_ARRAY => nom::combinator::map(
                |i| xdr_array(i, number::be_u64),
                NvValue::UintArray,
            )(input)?,
            DATA_TYPE_BOOLEAN_ARRAY => {
                nom::combinator::map(|i| xdr_array(i, xdr_bool), NvValue::BooleanArray)(input)?
            }
            DATA_TYPE_STRING_ARRAY => nom::combinator::map(
                nom::multi::count(xdr_string, nelem),
                NvValue::StringArray,
            )(input)?,
            DATA_TYPE_NVLIST => nom::combinator::map(NvList::parse, NvValue::NvList)(input)?,
            DATA_TYPE_NVLIST_ARRAY => nom::combinator::map(
                nom::multi::count(NvList::parse, nelem),
                NvValue::NvListArray,
            )(input)?,
            other => (input, NvValue::Unknown(other)),
        };
        Ok((input, (name, value)))
    }

    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            NvValue::Uint(v) => Some(*v),
            NvValue::Int(v) | NvValue::Hrtime(v) => Some(*v as u64),
            _ => None,
        }
    }
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            NvValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
    pub fn get_nvlist(&self, name: &str) -> Option<&NvList> {
        match self.get(name)? {
            NvValue::NvList(l) => Some(l),
            _ => None,
        }
    }
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(n, _)| n.as_str())
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.pairs {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

impl NvValue {
    pub fn to_json(&self) -> Value {
        match self {
            NvValue::Boolean => Value::Bool(true),
            NvValue::BooleanValue(b) => Value::Bool(*b),
            NvValue::Int(v) | NvValue::Hrtime(v) => Value::from(*v),
            NvValue::Uint(v) => Value::from(*v),
            NvValue::String(s) => Value::from(s.as_str()),
            NvValue::ByteArray(b) => Value::from(b.clone()),
            NvValue::IntArray(a) => Value::from(a.clone()),
            NvValue::UintArray(a) => Value::from(a.clone()),
            NvValue::BooleanArray(a) => Value::from(a.clone()),
            NvValue::StringArray(a) => Value::from(a.clone()),
            NvValue::NvList(l) => l.to_json(),
            NvValue::NvListArray(a) => Value::Array(a.iter().map(|l| l.to_json()).collect()),
            NvValue::Double(d) => {
                serde_json::Number::from_f64(*d).map_or(Value::Null, Value::Number)
            }
            NvValue::Unknown(_) => Value::Null,
        }
    }
}

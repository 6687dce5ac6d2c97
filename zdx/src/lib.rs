//!
//! Read-only decoding and traversal of ZFS pool metadata.
//!
//! Every operation takes an explicit [`PoolSession`]. Views are plain `Serialize` structs;
//! turning them into text is left to the caller.
//!
use std::io::Error as IoError;

use serde::Serialize;
use thiserror::Error;

mod compression;
mod fletcher;

pub mod block_tree;
pub mod catalog;
pub mod device;
pub mod dmu;
pub mod dsl;
pub mod dsl_tree;
pub mod errlog;
pub mod limits;
pub mod lineage;
pub mod nvlist;
pub mod session;
pub mod spa;
pub mod spacemap;
pub mod store;
pub mod view;
pub mod walk;
pub mod zap;
pub mod zap_cursor;
pub mod zpl;

#[cfg(test)]
mod testutil;

pub use crate::device::{BlockReader, Disk, RawDevice, VdevSet};
pub use crate::session::{Objset, PoolSession, Scope};
pub use crate::store::ObjectStore;

#[derive(Debug, Error)]
#[error("{source}")]
pub struct ZfsError {
    #[from]
    pub source: ZfsErrorKind,
}

impl ZfsError {
    pub fn kind(&self) -> &ZfsErrorKind {
        &self.source
    }
    pub fn class(&self) -> ErrorClass {
        self.source.class()
    }
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

impl From<IoError> for ZfsError {
    fn from(e: IoError) -> Self {
        ZfsErrorKind::from(e).into()
    }
}

impl<T> From<nom::Err<(T, nom::error::ErrorKind)>> for ZfsError {
    fn from(e: nom::Err<(T, nom::error::ErrorKind)>) -> Self {
        ZfsErrorKind::from(e).into()
    }
}

#[derive(Debug, Error)]
pub enum ZfsErrorKind {
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    TypeMismatch(String),
    #[error("Data parse error {0:?}")]
    Parse(nom::error::ErrorKind),
    #[error("Invalid data: {0}")]
    Invalid(String),
    #[error("Checksum validation error")]
    Checksum,
    #[error("Unsupported feature present: {0}")]
    UnsupportedFeature(String),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("IO Error {0}")]
    Io(IoError),
}

impl ZfsErrorKind {
    pub fn class(&self) -> ErrorClass {
        use ZfsErrorKind::*;
        match self {
            Precondition(_) => ErrorClass::Precondition,
            NotFound(_) => ErrorClass::NotFound,
            TypeMismatch(_) => ErrorClass::TypeMismatch,
            Parse(_) | Invalid(_) => ErrorClass::Decode,
            ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            // the block reader could not hand back usable bytes
            Checksum | UnsupportedFeature(_) | Io(_) => ErrorClass::Io,
        }
    }
}

impl From<IoError> for ZfsErrorKind {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl<T> From<nom::Err<(T, nom::error::ErrorKind)>> for ZfsErrorKind {
    fn from(e: nom::Err<(T, nom::error::ErrorKind)>) -> Self {
        Self::Parse(match e {
            nom::Err::Incomplete(_) => nom::error::ErrorKind::Complete,
            nom::Err::Error(e) => e.1,
            nom::Err::Failure(f) => f.1,
        })
    }
}

/// Caller-facing error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Precondition,
    NotFound,
    TypeMismatch,
    Decode,
    ResourceExhausted,
    Io,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Precondition => "precondition",
            ErrorClass::NotFound => "not_found",
            ErrorClass::TypeMismatch => "type_mismatch",
            ErrorClass::Decode => "decode",
            ErrorClass::ResourceExhausted => "resource_exhausted",
            ErrorClass::Io => "io",
        }
    }
}

pub(crate) fn precondition<T>(msg: impl Into<String>) -> Result<T, ZfsError> {
    Err(ZfsErrorKind::Precondition(msg.into()).into())
}

pub(crate) fn not_found<T>(msg: impl Into<String>) -> Result<T, ZfsError> {
    Err(ZfsErrorKind::NotFound(msg.into()).into())
}

pub(crate) fn type_mismatch<T>(msg: impl Into<String>) -> Result<T, ZfsError> {
    Err(ZfsErrorKind::TypeMismatch(msg.into()).into())
}

pub(crate) fn invalid<T>(msg: impl Into<String>) -> Result<T, ZfsError> {
    Err(ZfsErrorKind::Invalid(msg.into()).into())
}

/// Lowercase hex, two characters per byte.
pub fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

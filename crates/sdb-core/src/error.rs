//! Error Types for SDB
//!
//! This module defines all error types that can occur while producing or
//! consuming SDB files.
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - `Io`: underlying file/OS error (preserved `std::io::Error`)
//!
//! ### Data Integrity Errors
//! - `Format`: malformed header, wrong tag byte, overlarge level count,
//!   invalid magic marker, invalid LEB128 encoding
//! - `Truncated`: EOF reached in the middle of a stream record
//!
//! ### Protocol Errors
//! - `Sequence`: writer API called in the wrong state
//! - `OutOfOrder`: timestamp strictly before the last written timestamp
//! - `AlreadyExists`: header write attempted on a non-empty file
//!
//! ### Compatibility Errors
//! - `Unsupported`: unknown file version, reserved stream kind, or reserved
//!   compression kind encountered
//!
//! ## Usage
//! All fallible operations return `Result<T>`, aliased to
//! `Result<T, Error>`, so `?` propagates everywhere. The decoder treats a
//! short read as "need more input" (an `Ok` value), never as an error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid format: {0}")]
    Format(String),

    #[error("operation out of sequence: {0}")]
    Sequence(String),

    #[error("out-of-order timestamp {ts} (last written {last})")]
    OutOfOrder { ts: String, last: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("truncated file: {0}")]
    Truncated(String),

    #[error("file already has data: {0}")]
    AlreadyExists(String),
}

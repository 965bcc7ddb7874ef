//! Core types for the SDB single-day market-data file format.
//!
//! This crate holds everything the file layer and the tools share:
//!
//! - the error taxonomy ([`Error`], [`Result`])
//! - LEB128 varint primitives ([`varint`])
//! - stream kinds, trade sides, and price-unit conversion ([`types`])
//! - the wire codecs for individual stream records ([`sample`])
//!
//! The on-disk orchestration (header, metadata blocks, writer/reader state
//! machines) lives in `sdb-storage`.

pub mod error;
pub mod sample;
pub mod types;
pub mod varint;

pub use error::{Error, Result};
pub use sample::{FieldMask, PxLevel, QuoteSample, SecondsSample, TradeSample};
pub use types::{Aggr, BookLevel, PxConv, Scaled, Side, Steps, StreamType, ToSteps};

/// SDB format version understood by this implementation.
pub const VERSION: u32 = 1;

/// Marker separating file metadata from stream data (stored little-endian,
/// `BA BA BA AB` on disk).
pub const BEGIN_STREAM_DATA: u32 = 0xABBA_BABA;

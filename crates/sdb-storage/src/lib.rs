//! SDB file layer.
//!
//! This crate turns the record codecs of `sdb-core` into whole files:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Text header (shebang line .. blank line)     │
//! ├──────────────────────────────────────────────┤
//! │ StreamsMeta  (tag 0x01)                      │
//! │ - compression, data offset (back-patched),   │
//! │   list of stream kinds                       │
//! ├──────────────────────────────────────────────┤
//! │ CandlesMeta  (tag 0x03)                      │
//! │ - per-resolution CandleHeader (tag 0x04)     │
//! │ - per-resolution candle arrays (32B each,    │
//! │   rewritten in place on close)               │
//! ├──────────────────────────────────────────────┤
//! │ Magic marker BA BA BA AB                     │
//! ├──────────────────────────────────────────────┤
//! │ Stream data: SecondsSample / QuoteSample /   │
//! │ TradeSample records, delta-encoded           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! [`SdbWriter`] drives the write path as a strict state machine (header →
//! streams meta → candle index → data → close); [`SdbReader`] loads the
//! metadata and replays the record stream through a visitor. One file holds
//! one (exchange, symbol, instrument, UTC date) tuple.
//!
//! Everything here is single-threaded, synchronous file I/O. Instances are
//! not shareable across threads; distinct instances on distinct files are
//! fine.

pub mod candles;
pub mod config;
pub mod header;
pub mod path;
pub mod reader;
pub mod streams;
pub mod writer;

mod bookmark;

pub use candles::{Candle, CandleHeader, CandlesMeta};
pub use config::FileConfig;
pub use header::Header;
pub use reader::{Event, SdbReader};
pub use streams::{Compression, StreamsMeta};
pub use writer::SdbWriter;

pub use sdb_core::{Error, Result};

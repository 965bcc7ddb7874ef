//! Read-side orchestrator.
//!
//! `SdbReader::open` loads and validates everything up front — text header,
//! stream descriptors, the full candle index — then checks the magic marker
//! at the recorded beginning-of-data offset. `read` replays the record
//! stream through a visitor:
//!
//! ```ignore
//! let mut reader = SdbReader::open("20151015.KRX.KR4101.KR4101K60008.sdb")?;
//! reader.read(|event| {
//!     match event {
//!         Event::Trade { time, trade } => println!("{} {}", time, trade.px),
//!         _ => {}
//!     }
//!     true // keep going
//! })?;
//! ```
//!
//! Decoding works against a reusable buffer refilled from the file: a
//! record that is only partially buffered asks for more input instead of
//! failing, and unread bytes at EOF are a `Truncated` error. The reader
//! mirrors the writer's rolling state — the current second, the
//! microsecond cursor within it, and the per-kind price references reset by
//! every `SecondsSample` — so quotes and trades come out with absolute
//! times and absolute step-count prices.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use sdb_core::sample::{QuoteSample, SecondsSample, TradeSample, TYPE_MASK};
use sdb_core::types::StreamType;
use sdb_core::{Error, Result, BEGIN_STREAM_DATA, VERSION};

use crate::candles::CandlesMeta;
use crate::header::{Header, MIN_FILE_SIZE};
use crate::streams::StreamsMeta;

/// One decoded stream record, with times resolved to absolute UTC instants.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A whole-second anchor advanced the clock.
    Seconds { sec: u32 },
    /// A book snapshot. Levels carry absolute step-count prices.
    Quote {
        time: DateTime<Utc>,
        quote: QuoteSample,
    },
    /// A trade with its absolute step-count price.
    Trade {
        time: DateTime<Utc>,
        trade: TradeSample,
    },
}

/// Sequential reader for one SDB file.
pub struct SdbReader {
    file: File,
    path: PathBuf,
    header: Header,
    streams: StreamsMeta,
    candles: CandlesMeta,
    data_start: u64,
}

impl SdbReader {
    /// Open a file read-only and load its metadata.
    pub fn open(path: impl AsRef<Path>) -> Result<SdbReader> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let size = file.metadata()?.len();
        if size < MIN_FILE_SIZE {
            return Err(Error::Format(format!(
                "file is too small to be an SDB file: {} bytes",
                size
            )));
        }

        let (header, _) = Header::read(&mut file)?;
        if header.version != VERSION {
            return Err(Error::Unsupported(format!(
                "file version {}",
                header.version
            )));
        }

        let streams = StreamsMeta::read(&mut file)?;
        let candles = CandlesMeta::read(&mut file)?;

        let data_start = u64::from(streams.data_offset());
        file.seek(SeekFrom::Start(data_start))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| Error::Truncated("beginning-of-data marker".to_string()))?;
        let marker = u32::from_le_bytes(magic);
        if marker != BEGIN_STREAM_DATA {
            return Err(Error::Format(format!(
                "invalid beginning-of-data marker {:#010x}",
                marker
            )));
        }

        debug!(
            path = %path.display(),
            data_start,
            streams = streams.streams().len(),
            resolutions = candles.headers().len(),
            "opened sdb file"
        );

        Ok(SdbReader {
            file,
            path,
            header,
            streams,
            candles,
            data_start,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn streams(&self) -> &StreamsMeta {
        &self.streams
    }

    /// The candle index as stored in the file.
    pub fn candles(&self) -> &CandlesMeta {
        &self.candles
    }

    pub fn midnight(&self) -> DateTime<Utc> {
        self.header.midnight()
    }

    /// Replay every stream record through `visit`, in file order. The
    /// visitor returns `false` to stop early.
    pub fn read(&mut self, mut visit: impl FnMut(Event) -> bool) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.data_start + 4))?;

        let midnight = self.header.date;
        let max_side = usize::from(self.header.depth);

        let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
        let mut consumed = 0usize;

        let mut last_sec: u32 = 0;
        let mut last_usec: u32 = 0;
        let mut last_quote_px: Option<i64> = None;
        let mut last_trade_px: Option<i64> = None;

        loop {
            // Decode everything the buffer currently holds.
            while consumed < buf.len() {
                let tail = &buf[consumed..];
                let kind = StreamType::try_from(tail[0] & TYPE_MASK)?;
                let advanced = match kind {
                    StreamType::Seconds => match SecondsSample::decode(tail)? {
                        None => break,
                        Some((sample, n)) => {
                            if sample.sec < last_sec {
                                return Err(Error::Format(format!(
                                    "seconds moved backwards: {} after {}",
                                    sample.sec, last_sec
                                )));
                            }
                            last_sec = sample.sec;
                            last_usec = 0;
                            last_quote_px = None;
                            last_trade_px = None;
                            if !visit(Event::Seconds { sec: sample.sec }) {
                                return Ok(());
                            }
                            n
                        }
                    },
                    StreamType::Quotes => {
                        match QuoteSample::decode(tail, max_side, &mut last_quote_px)? {
                            None => break,
                            Some((quote, n)) => {
                                last_usec += quote.time_delta;
                                let time = midnight
                                    + Duration::seconds(i64::from(last_sec))
                                    + Duration::microseconds(i64::from(last_usec));
                                if !visit(Event::Quote { time, quote }) {
                                    return Ok(());
                                }
                                n
                            }
                        }
                    }
                    StreamType::Trade => match TradeSample::decode(tail, &mut last_trade_px)? {
                        None => break,
                        Some((trade, n)) => {
                            last_usec += trade.time_delta;
                            let time = midnight
                                + Duration::seconds(i64::from(last_sec))
                                + Duration::microseconds(i64::from(last_usec));
                            if !visit(Event::Trade { time, trade }) {
                                return Ok(());
                            }
                            n
                        }
                    },
                    other => {
                        return Err(Error::Unsupported(format!(
                            "stream kind {:?} is reserved",
                            other
                        )))
                    }
                };
                consumed += advanced;
            }

            // Shift out what we consumed and refill from the file.
            buf.drain(..consumed);
            consumed = 0;
            let mut chunk = [0u8; 8192];
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(());
                }
                return Err(Error::Truncated(format!(
                    "{} unread bytes form a partial record at end of file",
                    buf.len()
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

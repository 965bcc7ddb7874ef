//! Write-side orchestrator.
//!
//! `SdbWriter` owns one file descriptor and drives it through the format's
//! strict phase sequence:
//!
//! ```text
//! Init ──write_header──► Header ──write_streams_meta──► StreamsMeta
//!      ──write_candles_meta──► Data ──(quotes/trades)*──► close
//! ```
//!
//! `write_candles_meta` finishes the metadata section: once the candle index
//! is laid out, the beginning-of-data offset is known, so the StreamsMeta
//! field is back-patched and the magic marker is emitted in one step.
//!
//! ## Rolling references
//!
//! Every data write first settles the whole-second anchor. When the second
//! advances, a `SecondsSample` is emitted, the candle index records the
//! current file position for the new second, and the last-quote/last-trade
//! price references reset — which is what forces the first quote and trade
//! of each second to be encoded in full. Subsequent records in the same
//! second are deltas against their own kind.
//!
//! Timestamps must never move backwards. Equal timestamps are fine;
//! `OutOfOrder` rejections leave the file byte-for-byte untouched.
//!
//! ## Close
//!
//! `close` rewrites every candle array in place with the aggregated values
//! and marks the writer finished; it is idempotent, and `Drop` performs a
//! best-effort close for abandoned writers. A file whose writer errored
//! mid-stream is corrupt and must be discarded by the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use sdb_core::sample::{
    FieldMask, PxLevel, QuoteSample, SecondsSample, TradeSample, MAX_QUOTE_SIDE, MAX_SECONDS,
};
use sdb_core::types::{Aggr, BookLevel, Side, StreamType, ToSteps};
use sdb_core::{Error, Result, BEGIN_STREAM_DATA, VERSION};

use crate::candles::CandlesMeta;
use crate::config::FileConfig;
use crate::header::{Header, MIN_FILE_SIZE};
use crate::path::config_filename;
use crate::streams::StreamsMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Init,
    Header,
    StreamsMeta,
    Data,
}

/// Streaming writer for one SDB file. Single-threaded; one instance owns
/// its descriptor exclusively.
pub struct SdbWriter {
    file: File,
    path: PathBuf,
    header: Header,
    streams: Option<StreamsMeta>,
    candles: CandlesMeta,
    state: WriteState,
    existing: bool,
    closed: bool,

    last_ts: Option<DateTime<Utc>>,
    last_sec: u32,
    last_usec: u32,
    next_second: Option<u32>,
    last_quote_px: Option<i64>,
    last_trade_px: Option<i64>,
}

impl SdbWriter {
    /// Open (creating directories and the file as needed) the file named by
    /// `config`. No bytes are written yet; call [`write_header`] next.
    ///
    /// [`write_header`]: SdbWriter::write_header
    pub fn create(config: &FileConfig) -> Result<SdbWriter> {
        config.validate()?;
        let path = config_filename(config);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(config.file_permissions);
        }
        let file = opts.open(&path)?;
        let existing = file.metadata()?.len() >= MIN_FILE_SIZE;

        let header = Header::new(
            VERSION,
            config.exchange.clone(),
            config.symbol.clone(),
            config.instrument.clone(),
            config.secid,
            config.date,
            config.tz_name.clone(),
            config.tz_offset_secs,
            config.depth,
            config.px_step,
            config.uuid,
        );

        info!(path = %path.display(), existing, "opened sdb file for writing");

        Ok(SdbWriter {
            file,
            path,
            header,
            streams: None,
            candles: CandlesMeta::empty(),
            state: WriteState::Init,
            existing,
            closed: false,
            last_ts: None,
            last_sec: 0,
            last_usec: 0,
            next_second: None,
            last_quote_px: None,
            last_trade_px: None,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when `create` found a file that already carries data. Appending
    /// is not supported; such a file can only be read.
    pub fn existing(&self) -> bool {
        self.existing
    }

    /// The candle aggregates accumulated so far.
    pub fn candles(&self) -> &CandlesMeta {
        &self.candles
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Sequence("writer is closed".to_string()));
        }
        Ok(())
    }

    fn ensure_state(&self, expected: WriteState, op: &str) -> Result<()> {
        self.ensure_open()?;
        if self.state != expected {
            return Err(Error::Sequence(format!(
                "{} is not legal in the current writer phase ({:?})",
                op, self.state
            )));
        }
        Ok(())
    }

    /// Write the text header. The file must be empty.
    pub fn write_header(&mut self) -> Result<usize> {
        self.ensure_state(WriteState::Init, "write_header")?;
        if self.file.metadata()?.len() > 0 {
            return Err(Error::AlreadyExists(self.path.display().to_string()));
        }
        let n = self.header.write(&mut self.file)?;
        debug!(bytes = n, "wrote file header");
        self.state = WriteState::Header;
        Ok(n)
    }

    /// Write the stream descriptor block.
    pub fn write_streams_meta(&mut self, streams: Vec<StreamType>) -> Result<usize> {
        self.ensure_state(WriteState::Header, "write_streams_meta")?;
        let mut meta = StreamsMeta::new(streams);
        let n = meta.write(&mut self.file)?;
        self.streams = Some(meta);
        self.state = WriteState::StreamsMeta;
        Ok(n)
    }

    /// Write the candle index (typically with all-zero candles), back-patch
    /// the beginning-of-data offset, and emit the magic marker. The writer
    /// is ready for stream data afterwards.
    pub fn write_candles_meta(&mut self, mut meta: CandlesMeta) -> Result<usize> {
        self.ensure_state(WriteState::StreamsMeta, "write_candles_meta")?;
        let n = meta.write(&mut self.file)?;
        self.candles = meta;

        let pos = self.file.stream_position()?;
        let data_offset = u32::try_from(pos)
            .map_err(|_| Error::Format(format!("metadata section too large: {} bytes", pos)))?;
        self.streams
            .as_mut()
            .expect("streams meta was written in the previous phase")
            .write_data_offset(&mut self.file, data_offset)?;
        self.file.write_all(&BEGIN_STREAM_DATA.to_le_bytes())?;

        debug!(data_offset, "metadata complete, stream data begins");
        self.state = WriteState::Data;
        Ok(n + 4)
    }

    /// Settle the whole-second anchor for `ts`. Emits a `SecondsSample` and
    /// resets the per-kind price references whenever the second advances.
    /// Returns true in that case.
    fn write_seconds(&mut self, ts: DateTime<Utc>) -> Result<bool> {
        if let Some(last) = self.last_ts {
            if ts < last {
                return Err(Error::OutOfOrder {
                    ts: ts.to_rfc3339_opts(SecondsFormat::Micros, true),
                    last: last.to_rfc3339_opts(SecondsFormat::Micros, true),
                });
            }
        }
        let micros = (ts - self.header.date)
            .num_microseconds()
            .ok_or_else(|| Error::Format(format!("timestamp out of range: {}", ts)))?;
        if micros < 0 {
            return Err(Error::Format(format!(
                "timestamp {} precedes the file date {}",
                ts, self.header.date
            )));
        }
        let sec = micros / 1_000_000;
        if sec > i64::from(MAX_SECONDS) {
            return Err(Error::Format(format!(
                "timestamp {} does not fit the file's day",
                ts
            )));
        }
        let sec = sec as u32;
        let usec = (micros % 1_000_000) as u32;

        let changed = self.next_second.map_or(true, |next| sec >= next);
        if changed {
            let pos = self.file.stream_position()?;
            self.candles.update_data_offset(sec, pos);

            let mut buf = BytesMut::with_capacity(8);
            SecondsSample::new(sec).encode(&mut buf);
            self.file.write_all(&buf)?;

            self.next_second = Some(sec + 1);
            self.last_quote_px = None;
            self.last_trade_px = None;
        }

        self.last_ts = Some(ts);
        self.last_sec = sec;
        self.last_usec = usec;
        Ok(changed)
    }

    /// Write a book snapshot. `bids` are sorted best-first (descending
    /// price), `asks` best-first (ascending price), both in any price unit.
    /// A snapshot with no levels on either side is a no-op.
    pub fn write_quotes<P: ToSteps>(
        &mut self,
        ts: DateTime<Utc>,
        bids: &[BookLevel<P>],
        asks: &[BookLevel<P>],
    ) -> Result<usize> {
        self.ensure_state(WriteState::Data, "write_quotes")?;
        if bids.is_empty() && asks.is_empty() {
            return Ok(0);
        }
        let side_max = usize::from(self.header.depth).min(MAX_QUOTE_SIDE);
        if bids.len() > side_max || asks.len() > side_max {
            return Err(Error::Format(format!(
                "too many price levels: {} bids, {} asks (max {} per side)",
                bids.len(),
                asks.len(),
                side_max
            )));
        }

        let prev_usec = self.last_usec;
        let sec_changed = self.write_seconds(ts)?;
        let ts_delta = if sec_changed {
            self.last_usec
        } else {
            self.last_usec - prev_usec
        };

        // Traversal order: bids deepest->best, then asks best->outward.
        let conv = self.header.conv;
        let absolute: Vec<PxLevel> = bids
            .iter()
            .rev()
            .chain(asks.iter())
            .map(|level| PxLevel {
                px: level.px.to_steps(&conv),
                qty: level.qty,
            })
            .collect();
        let anchor = absolute[0].px;

        // After a second change the reference is cleared, so this snapshot
        // goes out in full; otherwise level 0 rides on the previous quote.
        let delta = self.last_quote_px.is_some();
        let mut wire = Vec::with_capacity(absolute.len());
        for (i, level) in absolute.iter().enumerate() {
            let base = if i == 0 {
                self.last_quote_px.unwrap_or(0)
            } else {
                absolute[i - 1].px
            };
            wire.push(PxLevel {
                px: level.px - base,
                qty: level.qty,
            });
        }

        let mut buf = BytesMut::with_capacity(8 + wire.len() * 20);
        let n = QuoteSample::encode(&mut buf, delta, ts_delta, &wire, bids.len(), asks.len());
        self.file.write_all(&buf)?;
        self.last_quote_px = Some(anchor);
        Ok(n)
    }

    /// Write one trade and fold it into the candle aggregates. Buys add to
    /// buy volume, sells to sell volume.
    pub fn write_trade<P: ToSteps>(
        &mut self,
        ts: DateTime<Utc>,
        side: Side,
        px: P,
        qty: u32,
        aggr: Aggr,
        order_id: Option<u64>,
        trade_id: Option<u64>,
    ) -> Result<usize> {
        self.ensure_state(WriteState::Data, "write_trade")?;

        let prev_usec = self.last_usec;
        let sec_changed = self.write_seconds(ts)?;
        let ts_delta = if sec_changed {
            self.last_usec
        } else {
            self.last_usec - prev_usec
        };

        let norm = px.to_steps(&self.header.conv);
        let delta = self.last_trade_px.is_some();
        let px_delta = norm - self.last_trade_px.unwrap_or(0);
        let mask = FieldMask::new(
            false,
            aggr,
            side,
            qty != 0,
            trade_id.is_some(),
            order_id.is_some(),
        );

        let mut buf = BytesMut::with_capacity(48);
        let n = TradeSample::encode(
            &mut buf,
            delta,
            ts_delta,
            mask,
            px_delta,
            i64::from(qty),
            trade_id.unwrap_or(0),
            order_id.unwrap_or(0),
        );
        self.file.write_all(&buf)?;

        let signed = match side {
            Side::Buy => i64::from(qty),
            Side::Sell => -i64::from(qty),
        };
        self.candles.update_candles(self.last_sec, norm, signed);
        self.last_trade_px = Some(norm);
        Ok(n)
    }

    /// Add externally-aggregated buy/sell volume to the candle buckets for
    /// `sec` (seconds since midnight) without emitting any record.
    pub fn add_candle_volumes(&mut self, sec: u32, buy_qty: u32, sell_qty: u32) -> Result<()> {
        self.ensure_state(WriteState::Data, "add_candle_volumes")?;
        self.candles.add_volumes(sec, buy_qty, sell_qty);
        Ok(())
    }

    /// Summary records are reserved in format version 1.
    pub fn write_summary(&mut self, _ts: DateTime<Utc>) -> Result<usize> {
        self.ensure_state(WriteState::Data, "write_summary")?;
        Err(Error::Unsupported(
            "summary records are reserved in format version 1".to_string(),
        ))
    }

    /// Message records are reserved in format version 1.
    pub fn write_message(&mut self, _ts: DateTime<Utc>, _msg: &str) -> Result<usize> {
        self.ensure_state(WriteState::Data, "write_message")?;
        Err(Error::Unsupported(
            "message records are reserved in format version 1".to_string(),
        ))
    }

    /// Push written bytes down to the device.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Commit the candle aggregates and finish the file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.state == WriteState::Data {
            self.candles.commit_candles(&mut self.file)?;
        }
        self.closed = true;
        self.last_ts = None;
        self.last_sec = 0;
        self.last_usec = 0;
        self.next_second = None;
        self.last_quote_px = None;
        self.last_trade_px = None;
        info!(path = %self.path.display(), "closed sdb file");
        Ok(())
    }
}

impl Drop for SdbWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), error = %e, "close failed in drop");
            }
        }
    }
}

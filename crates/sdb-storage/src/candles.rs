//! Candle index: per-resolution OHLC/volume aggregates with file offsets.
//!
//! ## On-disk layout
//!
//! ```text
//! CandlesMeta:
//! ┌──────────┬────────┬───────────────────┐
//! │ Tag 0x03 │ 0x00   │ resolution count  │
//! │ (1 byte) │ filler │ (2 bytes LE)      │
//! └──────────┴────────┴───────────────────┘
//! per resolution, a CandleHeader:
//! ┌──────────┬────────┬────────────┬──────────────┬──────────────┬──────────────┐
//! │ Tag 0x04 │ 0x00   │ resolution │ start second │ candle count │ array offset │
//! │ (1 byte) │ filler │ (2 LE)     │ (4 LE)       │ (4 LE)       │ (4 LE)       │
//! └──────────┴────────┴────────────┴──────────────┴──────────────┴──────────────┘
//! then, per resolution, a contiguous array of 32-byte candles:
//! ┌────────┬────────┬────────┬────────┬────────┬────────┬─────────────┐
//! │ open   │ high   │ low    │ close  │ b vol  │ s vol  │ data offset │
//! │ (4 LE) │ (4 LE) │ (4 LE) │ (4 LE) │ (4 LE) │ (4 LE) │ (8 LE)      │
//! └────────┴────────┴────────┴────────┴────────┴────────┴─────────────┘
//! ```
//!
//! ## Two write passes
//!
//! The writer first emits the meta block and every header with a zeroed
//! array offset (remembering where each offset field lives), then walks the
//! resolutions again: records the current position into the header slot and
//! emits the (at this point all-zero) candle array. At close,
//! `commit_candles` rewrites each array in place with the aggregated values.
//!
//! ## Aggregation
//!
//! Candles update online from trades: signed quantity adds to the buy or
//! sell volume, price folds into OHLC. Each resolution keeps the index of
//! the bucket it last touched so that the per-second offset update can
//! short-circuit repeated hits on the same bucket and only stamp a bucket's
//! `data_offset` the first time data lands in it.

use std::fs::File;
use std::io::{Read, Seek, Write};

use bytes::{BufMut, BytesMut};

use sdb_core::{Error, Result};

use crate::bookmark::with_position;

pub const CANDLES_META_TAG: u8 = 0x03;
pub const CANDLE_HEADER_TAG: u8 = 0x04;

/// Encoded size of one candle.
pub const CANDLE_SIZE: usize = 32;

/// Encoded size of one candle header record.
pub const CANDLE_HEADER_SIZE: usize = 16;

/// Longest supported candle bucket, in seconds.
pub const MAX_RESOLUTION: u16 = 3600;

/// One OHLC/volume bucket. Prices are step counts; `data_offset` is the
/// absolute file offset of the first stream record inside this bucket, or
/// zero if none landed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Candle {
    pub open: i32,
    pub high: i32,
    pub low: i32,
    pub close: i32,
    pub buy_volume: u32,
    pub sell_volume: u32,
    pub data_offset: u64,
}

impl Candle {
    pub fn volume(&self) -> u32 {
        self.buy_volume + self.sell_volume
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.open);
        buf.put_i32_le(self.high);
        buf.put_i32_le(self.low);
        buf.put_i32_le(self.close);
        buf.put_u32_le(self.buy_volume);
        buf.put_u32_le(self.sell_volume);
        buf.put_u64_le(self.data_offset);
    }

    fn decode(bytes: &[u8]) -> Candle {
        debug_assert_eq!(bytes.len(), CANDLE_SIZE);
        let u32_at = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().expect("4 bytes"));
        Candle {
            open: u32_at(0) as i32,
            high: u32_at(4) as i32,
            low: u32_at(8) as i32,
            close: u32_at(12) as i32,
            buy_volume: u32_at(16),
            sell_volume: u32_at(20),
            data_offset: u64::from_le_bytes(bytes[24..32].try_into().expect("8 bytes")),
        }
    }
}

/// One candle resolution: its bucket geometry, its array of candles, and the
/// file offset the array was written at.
#[derive(Debug, Clone)]
pub struct CandleHeader {
    resolution: u16,
    start_time: u32,
    data_offset: u64,
    /// Index of the bucket most recently touched by the aggregator.
    last_updated: Option<usize>,
    candles: Vec<Candle>,
}

impl CandleHeader {
    /// Create a resolution covering `[start_time, end_time)` seconds since
    /// midnight.
    pub fn new(resolution: u16, start_time: u32, end_time: u32) -> Result<Self> {
        if resolution == 0 || resolution > MAX_RESOLUTION {
            return Err(Error::Format(format!(
                "invalid candle resolution {} (1..={})",
                resolution, MAX_RESOLUTION
            )));
        }
        if end_time <= start_time {
            return Err(Error::Format(format!(
                "candle range is empty: start {} end {}",
                start_time, end_time
            )));
        }
        let count = Self::calc_size(start_time, end_time, resolution);
        Ok(Self {
            resolution,
            start_time,
            data_offset: 0,
            last_updated: None,
            candles: vec![Candle::default(); count],
        })
    }

    /// Number of buckets needed to cover `[start, end)`:
    /// `ceil((end - start) / resolution)`.
    pub fn calc_size(start_time: u32, end_time: u32, resolution: u16) -> usize {
        debug_assert!(end_time > start_time && resolution > 0);
        let diff = (end_time - start_time) as usize;
        diff.div_ceil(resolution as usize)
    }

    pub fn resolution(&self) -> u16 {
        self.resolution
    }

    /// First covered second since midnight.
    pub fn start_time(&self) -> u32 {
        self.start_time
    }

    /// File offset of this resolution's candle array (0 before layout).
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Map a second-since-midnight to its bucket index.
    pub fn time_to_candle(&self, ts: u32) -> Option<usize> {
        let n = (ts.checked_sub(self.start_time)? / u32::from(self.resolution)) as usize;
        (n < self.candles.len()).then_some(n)
    }

    /// Start second of bucket `idx`.
    pub fn candle_to_time(&self, idx: usize) -> u32 {
        debug_assert!(idx < self.candles.len());
        self.start_time + u32::from(self.resolution) * idx as u32
    }

    /// Fold one trade into its bucket. Returns false when `ts` is outside
    /// the covered range.
    pub fn update_candle(&mut self, ts: u32, px: i64, qty: i64) -> bool {
        let Some(idx) = self.time_to_candle(ts) else {
            return false;
        };
        let px = px as i32;
        let c = &mut self.candles[idx];
        if c.open == 0 {
            c.open = px;
        }
        if c.high < px {
            c.high = px;
        }
        if c.low > px || c.low == 0 {
            c.low = px;
        }
        c.close = px;
        if qty > 0 {
            c.buy_volume += qty as u32;
        }
        if qty < 0 {
            c.sell_volume += (-qty) as u32;
        }
        self.last_updated = Some(idx);
        true
    }

    /// Add externally-aggregated volumes to a bucket without touching OHLC.
    pub fn add_volume(&mut self, ts: u32, buy_qty: u32, sell_qty: u32) -> bool {
        let Some(idx) = self.time_to_candle(ts) else {
            return false;
        };
        let c = &mut self.candles[idx];
        c.buy_volume += buy_qty;
        c.sell_volume += sell_qty;
        self.last_updated = Some(idx);
        true
    }

    /// Stamp the bucket for `ts` with `file_pos` if it is a bucket we have
    /// not touched yet. Repeated hits on the current bucket are no-ops, so
    /// each bucket keeps the offset of its first record.
    pub fn update_data_offset(&mut self, ts: u32, file_pos: u64) {
        let Some(idx) = self.time_to_candle(ts) else {
            return;
        };
        if self.last_updated == Some(idx) {
            return;
        }
        self.candles[idx].data_offset = file_pos;
        self.last_updated = Some(idx);
    }

    /// Rewrite this resolution's candle array in place.
    pub fn commit(&self, file: &mut File) -> Result<()> {
        if self.data_offset == 0 {
            return Err(Error::Sequence(
                "candle array has not been laid out in the file".to_string(),
            ));
        }
        let mut buf = BytesMut::with_capacity(self.candles.len() * CANDLE_SIZE);
        for c in &self.candles {
            c.encode(&mut buf);
        }
        with_position(file, self.data_offset, |f| {
            f.write_all(&buf)?;
            Ok(())
        })
    }
}

/// The ordered set of candle resolutions in a file.
#[derive(Debug, Clone, Default)]
pub struct CandlesMeta {
    headers: Vec<CandleHeader>,
}

impl CandlesMeta {
    pub fn new(headers: Vec<CandleHeader>) -> Self {
        Self { headers }
    }

    /// A file with no candle index at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> &[CandleHeader] {
        &self.headers
    }

    /// Write the index at the current position. Candle contents are
    /// typically all zero here; `commit_candles` fills them in at close.
    pub fn write(&mut self, file: &mut File) -> Result<usize> {
        let start = file.stream_position()?;

        let mut buf = BytesMut::with_capacity(4 + self.headers.len() * CANDLE_HEADER_SIZE);
        buf.put_u8(CANDLES_META_TAG);
        buf.put_u8(0);
        buf.put_u16_le(self.headers.len() as u16);
        file.write_all(&buf)?;

        // First pass: headers with zeroed array offsets, remembering where
        // each offset field lands.
        let mut offset_slots = Vec::with_capacity(self.headers.len());
        for hdr in &self.headers {
            offset_slots.push(file.stream_position()? + 12);
            let mut buf = BytesMut::with_capacity(CANDLE_HEADER_SIZE);
            buf.put_u8(CANDLE_HEADER_TAG);
            buf.put_u8(0);
            buf.put_u16_le(hdr.resolution);
            buf.put_u32_le(hdr.start_time);
            buf.put_u32_le(hdr.candles.len() as u32);
            buf.put_u32_le(0);
            file.write_all(&buf)?;
        }

        // Second pass: patch each header with its array position, then emit
        // the array itself.
        for (hdr, slot) in self.headers.iter_mut().zip(offset_slots) {
            let pos = file.stream_position()?;
            hdr.data_offset = pos;
            with_position(file, slot, |f| {
                f.write_all(&(pos as u32).to_le_bytes())?;
                Ok(())
            })?;

            let mut buf = BytesMut::with_capacity(hdr.candles.len() * CANDLE_SIZE);
            for c in &hdr.candles {
                c.encode(&mut buf);
            }
            file.write_all(&buf)?;
        }

        Ok((file.stream_position()? - start) as usize)
    }

    /// Read the index at the current position (right after StreamsMeta).
    pub fn read(file: &mut File) -> Result<CandlesMeta> {
        let mut fixed = [0u8; 4];
        file.read_exact(&mut fixed)
            .map_err(|_| Error::Truncated("candle index".to_string()))?;
        if fixed[0] != CANDLES_META_TAG {
            return Err(Error::Format(format!(
                "invalid CandlesMeta tag {:#04x} (expected {:#04x})",
                fixed[0], CANDLES_META_TAG
            )));
        }
        if fixed[1] != 0 {
            return Err(Error::Format(format!(
                "invalid CandlesMeta filler {:#04x}",
                fixed[1]
            )));
        }
        let count = u16::from_le_bytes(fixed[2..4].try_into().expect("2 bytes")) as usize;

        let mut raw = vec![0u8; count * CANDLE_HEADER_SIZE];
        file.read_exact(&mut raw)
            .map_err(|_| Error::Truncated("candle headers".to_string()))?;

        let mut headers = Vec::with_capacity(count);
        for rec in raw.chunks_exact(CANDLE_HEADER_SIZE) {
            if rec[0] != CANDLE_HEADER_TAG {
                return Err(Error::Format(format!(
                    "invalid CandleHeader tag {:#04x}",
                    rec[0]
                )));
            }
            if rec[1] != 0 {
                return Err(Error::Format(format!(
                    "invalid CandleHeader filler {:#04x}",
                    rec[1]
                )));
            }
            let resolution = u16::from_le_bytes(rec[2..4].try_into().expect("2 bytes"));
            let start_time = u32::from_le_bytes(rec[4..8].try_into().expect("4 bytes"));
            let candle_cnt = u32::from_le_bytes(rec[8..12].try_into().expect("4 bytes")) as usize;
            let data_offset = u32::from_le_bytes(rec[12..16].try_into().expect("4 bytes"));
            if resolution == 0 || resolution > MAX_RESOLUTION {
                return Err(Error::Format(format!(
                    "invalid candle resolution {}",
                    resolution
                )));
            }
            headers.push(CandleHeader {
                resolution,
                start_time,
                data_offset: u64::from(data_offset),
                last_updated: None,
                candles: vec![Candle::default(); candle_cnt],
            });
        }

        for hdr in &mut headers {
            let mut raw = vec![0u8; hdr.candles.len() * CANDLE_SIZE];
            file.read_exact(&mut raw).map_err(|_| {
                Error::Truncated(format!(
                    "candle array for resolution {}s",
                    hdr.resolution
                ))
            })?;
            for (c, bytes) in hdr.candles.iter_mut().zip(raw.chunks_exact(CANDLE_SIZE)) {
                *c = Candle::decode(bytes);
            }
        }

        Ok(CandlesMeta { headers })
    }

    /// Fold a trade into every resolution.
    pub fn update_candles(&mut self, ts: u32, px: i64, qty: i64) {
        for hdr in &mut self.headers {
            hdr.update_candle(ts, px, qty);
        }
    }

    /// Stamp the first-record offset for `ts` in every resolution.
    pub fn update_data_offset(&mut self, ts: u32, file_pos: u64) {
        for hdr in &mut self.headers {
            hdr.update_data_offset(ts, file_pos);
        }
    }

    /// Add buy/sell volumes to every resolution.
    pub fn add_volumes(&mut self, ts: u32, buy_qty: u32, sell_qty: u32) {
        for hdr in &mut self.headers {
            hdr.add_volume(ts, buy_qty, sell_qty);
        }
    }

    /// Rewrite every resolution's candle array in place.
    pub fn commit_candles(&self, file: &mut File) -> Result<()> {
        for hdr in &self.headers {
            hdr.commit(file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    // ---------------------------------------------------------------
    // Geometry
    // ---------------------------------------------------------------

    #[test]
    fn test_calc_size_exact_and_ceiling() {
        assert_eq!(CandleHeader::calc_size(32_400, 54_000, 300), 72);
        assert_eq!(CandleHeader::calc_size(0, 60, 60), 1);
        // 100 seconds at 60s resolution needs two buckets
        assert_eq!(CandleHeader::calc_size(0, 100, 60), 2);
        assert_eq!(CandleHeader::calc_size(10, 11, 300), 1);
    }

    #[test]
    fn test_new_validates_geometry() {
        assert!(CandleHeader::new(0, 0, 60).is_err());
        assert!(CandleHeader::new(3601, 0, 7200).is_err());
        assert!(CandleHeader::new(60, 100, 100).is_err());
        assert!(CandleHeader::new(60, 100, 50).is_err());
        assert!(CandleHeader::new(3600, 0, 86_400).is_ok());
    }

    #[test]
    fn test_time_to_candle_bounds() {
        let hdr = CandleHeader::new(300, 32_400, 54_000).unwrap();
        assert_eq!(hdr.time_to_candle(32_399), None);
        assert_eq!(hdr.time_to_candle(32_400), Some(0));
        assert_eq!(hdr.time_to_candle(32_699), Some(0));
        assert_eq!(hdr.time_to_candle(32_700), Some(1));
        assert_eq!(hdr.time_to_candle(53_999), Some(71));
        assert_eq!(hdr.time_to_candle(54_000), None);
    }

    #[test]
    fn test_candle_to_time_inverts_bucket_index() {
        let hdr = CandleHeader::new(300, 32_400, 54_000).unwrap();
        assert_eq!(hdr.candle_to_time(0), 32_400);
        assert_eq!(hdr.candle_to_time(71), 53_700);
    }

    // ---------------------------------------------------------------
    // Aggregation
    // ---------------------------------------------------------------

    #[test]
    fn test_update_candle_ohlc_and_volumes() {
        let mut hdr = CandleHeader::new(60, 32_400, 36_000).unwrap();
        assert!(hdr.update_candle(32_400, 1000, 5));
        assert!(hdr.update_candle(32_430, 1005, 3));
        assert!(hdr.update_candle(32_445, 995, -2));

        let c = hdr.candles()[0];
        assert_eq!(c.open, 1000);
        assert_eq!(c.high, 1005);
        assert_eq!(c.low, 995);
        assert_eq!(c.close, 995);
        assert_eq!(c.buy_volume, 8);
        assert_eq!(c.sell_volume, 2);
        assert_eq!(c.volume(), 10);

        assert!(hdr.update_candle(32_460, 1002, 1));
        let c = hdr.candles()[1];
        assert_eq!(c.open, 1002);
        assert_eq!(c.close, 1002);
        assert_eq!(c.buy_volume, 1);
        assert_eq!(c.sell_volume, 0);
    }

    #[test]
    fn test_update_candle_out_of_range() {
        let mut hdr = CandleHeader::new(60, 32_400, 36_000).unwrap();
        assert!(!hdr.update_candle(1000, 500, 1));
        assert!(!hdr.update_candle(36_000, 500, 1));
        assert!(hdr.candles().iter().all(|c| *c == Candle::default()));
    }

    #[test]
    fn test_zero_qty_leaves_volumes() {
        let mut hdr = CandleHeader::new(60, 0, 600).unwrap();
        assert!(hdr.update_candle(30, 123, 0));
        let c = hdr.candles()[0];
        assert_eq!(c.buy_volume, 0);
        assert_eq!(c.sell_volume, 0);
        assert_eq!(c.close, 123);
    }

    #[test]
    fn test_add_volume_skips_ohlc() {
        let mut hdr = CandleHeader::new(60, 0, 600).unwrap();
        assert!(hdr.add_volume(30, 7, 4));
        let c = hdr.candles()[0];
        assert_eq!(c.buy_volume, 7);
        assert_eq!(c.sell_volume, 4);
        assert_eq!(c.open, 0);
        assert_eq!(c.close, 0);
    }

    #[test]
    fn test_update_data_offset_first_hit_wins() {
        let mut hdr = CandleHeader::new(60, 0, 600).unwrap();
        hdr.update_data_offset(10, 1111);
        hdr.update_data_offset(20, 2222); // same bucket, ignored
        assert_eq!(hdr.candles()[0].data_offset, 1111);

        hdr.update_data_offset(65, 3333); // next bucket
        assert_eq!(hdr.candles()[1].data_offset, 3333);
        assert_eq!(hdr.candles()[0].data_offset, 1111);
    }

    #[test]
    fn test_fan_out_across_resolutions() {
        let mut meta = CandlesMeta::new(vec![
            CandleHeader::new(60, 0, 600).unwrap(),
            CandleHeader::new(300, 0, 600).unwrap(),
        ]);
        meta.update_candles(90, 1000, 5);
        assert_eq!(meta.headers()[0].candles()[1].close, 1000);
        assert_eq!(meta.headers()[1].candles()[0].close, 1000);

        meta.add_volumes(90, 2, 1);
        assert_eq!(meta.headers()[0].candles()[1].buy_volume, 7);
        assert_eq!(meta.headers()[1].candles()[0].sell_volume, 1);
    }

    // ---------------------------------------------------------------
    // File round-trip
    // ---------------------------------------------------------------

    fn open_temp() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("candles.sdb"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn test_write_size_single_resolution() {
        let (_dir, mut file) = open_temp();
        let mut meta =
            CandlesMeta::new(vec![CandleHeader::new(300, 32_400, 54_000).unwrap()]);
        let written = meta.write(&mut file).unwrap();
        assert_eq!(written, 4 + CANDLE_HEADER_SIZE + 72 * CANDLE_SIZE);
        // the array starts right after the meta + header records
        assert_eq!(meta.headers()[0].data_offset(), 4 + 16);
    }

    #[test]
    fn test_write_empty_index() {
        let (_dir, mut file) = open_temp();
        let mut meta = CandlesMeta::empty();
        assert_eq!(meta.write(&mut file).unwrap(), 4);
    }

    #[test]
    fn test_commit_then_read_roundtrip() {
        let (_dir, mut file) = open_temp();
        let mut meta = CandlesMeta::new(vec![
            CandleHeader::new(60, 32_400, 36_000).unwrap(),
            CandleHeader::new(300, 32_400, 36_000).unwrap(),
        ]);
        meta.write(&mut file).unwrap();
        let end = file.stream_position().unwrap();

        meta.update_data_offset(32_400, 4096);
        meta.update_candles(32_400, 1000, 5);
        meta.update_candles(32_430, 1005, -3);
        meta.commit_candles(&mut file).unwrap();
        assert_eq!(file.stream_position().unwrap(), end);

        file.seek(SeekFrom::Start(0)).unwrap();
        let parsed = CandlesMeta::read(&mut file).unwrap();
        assert_eq!(parsed.headers().len(), 2);

        let minute = &parsed.headers()[0];
        assert_eq!(minute.resolution(), 60);
        assert_eq!(minute.start_time(), 32_400);
        assert_eq!(minute.candles().len(), 60);
        let c = minute.candles()[0];
        assert_eq!(c.open, 1000);
        assert_eq!(c.high, 1005);
        assert_eq!(c.low, 1000);
        assert_eq!(c.close, 1005);
        assert_eq!(c.buy_volume, 5);
        assert_eq!(c.sell_volume, 3);
        assert_eq!(c.data_offset, 4096);

        let five_min = &parsed.headers()[1];
        assert_eq!(five_min.resolution(), 300);
        assert_eq!(five_min.candles().len(), 12);
        assert_eq!(five_min.candles()[0].close, 1005);

        // reading consumed the whole index
        assert_eq!(file.stream_position().unwrap(), end);
    }

    #[test]
    fn test_commit_before_layout_is_sequence_error() {
        let (_dir, mut file) = open_temp();
        let meta = CandlesMeta::new(vec![CandleHeader::new(60, 0, 600).unwrap()]);
        assert!(matches!(
            meta.commit_candles(&mut file),
            Err(Error::Sequence(_))
        ));
    }

    #[test]
    fn test_read_rejects_bad_tags() {
        let (_dir, mut file) = open_temp();
        file.write_all(&[0x09, 0, 1, 0]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert!(matches!(CandlesMeta::read(&mut file), Err(Error::Format(_))));
    }
}

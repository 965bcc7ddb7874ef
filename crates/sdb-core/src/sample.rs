//! Stream record codecs.
//!
//! Every stream record starts with a single byte: the stream kind in the low
//! 7 bits and a delta flag in the high bit. A set delta flag means the body
//! is encoded against the most recent reference of the same kind (the last
//! quote's first price, or the last trade price); a clear flag means the
//! body is absolute ("full").
//!
//! ## Record layouts
//!
//! ```text
//! SecondsSample: <0x00> <sleb128 seconds-since-midnight>
//!
//! QuoteSample:   <0x01 | D<<7>
//!                <uleb128 microsecond time delta>
//!                <1 byte: ask_count<<4 | bid_count>        (nibbles, 0..15)
//!                levels in traversal order (bids deepest->best,
//!                then asks best->outward), each:
//!                <sleb128 price delta> <sleb128 qty>
//!
//! TradeSample:   <0x02 | D<<7>
//!                <uleb128 microsecond time delta>
//!                <1 byte field mask>
//!                <sleb128 price delta>
//!                [<sleb128 qty>]            if has_qty
//!                [<uleb128 trade id>]       if has_trade_id
//!                [<uleb128 order id>]       if has_order_id
//! ```
//!
//! The first price of a quote is absolute when D=0, else relative to the
//! previous quote's first price; every later level is relative to the level
//! before it. Decoders restore absolute prices by cumulative sum and report
//! the restored level-0 price back through the caller's rolling reference.
//!
//! ## Short reads
//! Decoders take the full unread tail of the input buffer. If the record is
//! not completely buffered yet they return `Ok(None)` without consuming
//! anything, so the file reader can refill and retry. Malformed bytes are
//! `Format` errors.

use bytes::BufMut;

use crate::types::{Aggr, Side, StreamType};
use crate::varint::{decode_sleb128, decode_uleb128, encode_sleb128, encode_uleb128};
use crate::{Error, Result};

/// High bit of the record's first byte: body is delta-encoded.
pub const DELTA_FLAG: u8 = 0x80;

/// Low 7 bits of the record's first byte: the stream kind.
pub const TYPE_MASK: u8 = 0x7F;

/// Per-side level limit imposed by the nibble-packed count byte.
pub const MAX_QUOTE_SIDE: usize = 15;

/// Seconds-since-midnight must fit in 24 bits.
pub const MAX_SECONDS: u32 = (1 << 24) - 1;

/// One price level on the wire / in a decoded quote. Prices are step counts;
/// decoded levels are absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PxLevel {
    pub px: i64,
    pub qty: i64,
}

//------------------------------------------------------------------------------
// SecondsSample
//------------------------------------------------------------------------------

/// Whole-second anchor record. Everything that follows it, up to the next
/// `SecondsSample`, is timed as microseconds relative to this second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondsSample {
    /// Seconds since UTC midnight of the file's date.
    pub sec: u32,
}

impl SecondsSample {
    pub fn new(sec: u32) -> Self {
        debug_assert!(sec <= MAX_SECONDS);
        Self { sec }
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut impl BufMut) -> usize {
        buf.put_u8(StreamType::Seconds as u8);
        1 + encode_sleb128(buf, i64::from(self.sec))
    }

    /// Decode from the unread tail of a buffer (positioned at the tag byte).
    pub fn decode(buf: &[u8]) -> Result<Option<(SecondsSample, usize)>> {
        debug_assert_eq!(buf[0] & TYPE_MASK, StreamType::Seconds as u8);
        let mut cur = &buf[1..];
        let Some(sec) = decode_sleb128(&mut cur)? else {
            return Ok(None);
        };
        if !(0..=i64::from(MAX_SECONDS)).contains(&sec) {
            return Err(Error::Format(format!(
                "seconds since midnight out of range: {}",
                sec
            )));
        }
        let consumed = buf.len() - cur.len();
        Ok(Some((SecondsSample { sec: sec as u32 }, consumed)))
    }
}

//------------------------------------------------------------------------------
// QuoteSample
//------------------------------------------------------------------------------

/// A decoded book snapshot. `levels` holds absolute step-count prices in
/// traversal order: bids deepest-first, then asks best-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteSample {
    /// Microseconds since the reference instant (see the writer's time
    /// delta rule).
    pub time_delta: u32,
    pub bid_count: usize,
    pub ask_count: usize,
    pub levels: Vec<PxLevel>,
}

impl QuoteSample {
    /// Bids from best to deepest (prices descending).
    pub fn bids(&self) -> impl DoubleEndedIterator<Item = &PxLevel> {
        self.levels[..self.bid_count].iter().rev()
    }

    /// Asks from best outward (prices ascending).
    pub fn asks(&self) -> &[PxLevel] {
        &self.levels[self.bid_count..]
    }

    /// Encode a quote record. `levels` must already be delta-encoded in
    /// traversal order (the writer owns the differencing); counts are the
    /// caller-validated per-side level counts.
    pub fn encode(
        buf: &mut impl BufMut,
        delta: bool,
        time_delta: u32,
        levels: &[PxLevel],
        bid_count: usize,
        ask_count: usize,
    ) -> usize {
        debug_assert!(bid_count <= MAX_QUOTE_SIDE && ask_count <= MAX_QUOTE_SIDE);
        debug_assert_eq!(levels.len(), bid_count + ask_count);

        let tag = StreamType::Quotes as u8 | if delta { DELTA_FLAG } else { 0 };
        buf.put_u8(tag);
        let mut n = 1 + encode_uleb128(buf, u64::from(time_delta));
        buf.put_u8(((ask_count as u8) << 4) | bid_count as u8);
        n += 1;
        for level in levels {
            n += encode_sleb128(buf, level.px);
            n += encode_sleb128(buf, level.qty);
        }
        n
    }

    /// Decode from the unread tail of a buffer (positioned at the tag byte).
    ///
    /// `last_px` is the rolling reference: consumed when the record's delta
    /// flag is set, and updated to the restored level-0 price on success.
    /// `max_side` is the per-side level limit from the file header.
    pub fn decode(
        buf: &[u8],
        max_side: usize,
        last_px: &mut Option<i64>,
    ) -> Result<Option<(QuoteSample, usize)>> {
        debug_assert_eq!(buf[0] & TYPE_MASK, StreamType::Quotes as u8);
        let delta = buf[0] & DELTA_FLAG != 0;
        let mut cur = &buf[1..];

        let Some(time_delta) = decode_uleb128(&mut cur)? else {
            return Ok(None);
        };
        let time_delta = u32::try_from(time_delta)
            .map_err(|_| Error::Format(format!("quote time delta too large: {}", time_delta)))?;

        let Some((&counts, rest)) = cur.split_first() else {
            return Ok(None);
        };
        cur = rest;
        let bid_count = (counts & 0x0F) as usize;
        let ask_count = (counts >> 4) as usize;
        if bid_count > max_side || ask_count > max_side {
            return Err(Error::Format(format!(
                "too many price levels: {} bids, {} asks (max {})",
                bid_count, ask_count, max_side
            )));
        }
        let total = bid_count + ask_count;
        if total == 0 {
            return Err(Error::Format("quote record with no levels".to_string()));
        }

        let mut levels = Vec::with_capacity(total);
        let mut prev = 0i64;
        for i in 0..total {
            let Some(dpx) = decode_sleb128(&mut cur)? else {
                return Ok(None);
            };
            let Some(qty) = decode_sleb128(&mut cur)? else {
                return Ok(None);
            };
            let px = if i == 0 {
                if delta {
                    let last = last_px.ok_or_else(|| {
                        Error::Format("delta quote without a reference price".to_string())
                    })?;
                    last + dpx
                } else {
                    dpx
                }
            } else {
                prev + dpx
            };
            prev = px;
            levels.push(PxLevel { px, qty });
        }

        *last_px = Some(levels[0].px);
        let consumed = buf.len() - cur.len();
        Ok(Some((
            QuoteSample {
                time_delta,
                bid_count,
                ask_count,
                levels,
            },
            consumed,
        )))
    }
}

//------------------------------------------------------------------------------
// TradeSample
//------------------------------------------------------------------------------

/// Per-trade attribute bits, packed into one byte:
///
/// ```text
/// bit 0    internal
/// bits 1-2 aggressor (0 undefined, 1 aggressor, 2 passive)
/// bit 3    side (0 buy, 1 sell)
/// bit 4    has_qty
/// bit 5    has_trade_id
/// bit 6    has_order_id
/// bit 7    reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMask(pub u8);

impl FieldMask {
    pub fn new(
        internal: bool,
        aggr: Aggr,
        side: Side,
        has_qty: bool,
        has_trade_id: bool,
        has_order_id: bool,
    ) -> Self {
        let mut bits = 0u8;
        if internal {
            bits |= 0x01;
        }
        bits |= (aggr as u8) << 1;
        if side == Side::Sell {
            bits |= 0x08;
        }
        if has_qty {
            bits |= 0x10;
        }
        if has_trade_id {
            bits |= 0x20;
        }
        if has_order_id {
            bits |= 0x40;
        }
        FieldMask(bits)
    }

    pub fn internal(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn aggr(self) -> Aggr {
        match (self.0 >> 1) & 0x03 {
            1 => Aggr::Aggressor,
            2 => Aggr::Passive,
            _ => Aggr::Undefined,
        }
    }

    pub fn side(self) -> Side {
        if self.0 & 0x08 != 0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    pub fn has_qty(self) -> bool {
        self.0 & 0x10 != 0
    }

    pub fn has_trade_id(self) -> bool {
        self.0 & 0x20 != 0
    }

    pub fn has_order_id(self) -> bool {
        self.0 & 0x40 != 0
    }
}

/// A decoded trade. `px` is the absolute step-count price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeSample {
    pub time_delta: u32,
    pub mask: FieldMask,
    pub px: i64,
    pub qty: i64,
    pub trade_id: u64,
    pub order_id: u64,
}

impl TradeSample {
    pub fn side(&self) -> Side {
        self.mask.side()
    }

    pub fn aggr(&self) -> Aggr {
        self.mask.aggr()
    }

    pub fn has_qty(&self) -> bool {
        self.mask.has_qty()
    }

    pub fn has_trade_id(&self) -> bool {
        self.mask.has_trade_id()
    }

    pub fn has_order_id(&self) -> bool {
        self.mask.has_order_id()
    }

    /// Encode a trade record. `px_delta` is the pre-differenced price (the
    /// writer owns the delta arithmetic). Optional fields are written only
    /// when the corresponding mask bit is set.
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        buf: &mut impl BufMut,
        delta: bool,
        time_delta: u32,
        mask: FieldMask,
        px_delta: i64,
        qty: i64,
        trade_id: u64,
        order_id: u64,
    ) -> usize {
        let tag = StreamType::Trade as u8 | if delta { DELTA_FLAG } else { 0 };
        buf.put_u8(tag);
        let mut n = 1 + encode_uleb128(buf, u64::from(time_delta));
        buf.put_u8(mask.0);
        n += 1;
        n += encode_sleb128(buf, px_delta);
        if mask.has_qty() {
            n += encode_sleb128(buf, qty);
        }
        if mask.has_trade_id() {
            n += encode_uleb128(buf, trade_id);
        }
        if mask.has_order_id() {
            n += encode_uleb128(buf, order_id);
        }
        n
    }

    /// Decode from the unread tail of a buffer (positioned at the tag byte).
    /// `last_px` is consumed for delta records and updated to the restored
    /// absolute price on success.
    pub fn decode(buf: &[u8], last_px: &mut Option<i64>) -> Result<Option<(TradeSample, usize)>> {
        debug_assert_eq!(buf[0] & TYPE_MASK, StreamType::Trade as u8);
        let delta = buf[0] & DELTA_FLAG != 0;
        let mut cur = &buf[1..];

        let Some(time_delta) = decode_uleb128(&mut cur)? else {
            return Ok(None);
        };
        let time_delta = u32::try_from(time_delta)
            .map_err(|_| Error::Format(format!("trade time delta too large: {}", time_delta)))?;

        let Some((&mask_byte, rest)) = cur.split_first() else {
            return Ok(None);
        };
        cur = rest;
        let mask = FieldMask(mask_byte);

        let Some(px_raw) = decode_sleb128(&mut cur)? else {
            return Ok(None);
        };
        let px = if delta {
            let last = last_px.ok_or_else(|| {
                Error::Format("delta trade without a reference price".to_string())
            })?;
            last + px_raw
        } else {
            px_raw
        };

        let mut qty = 0i64;
        if mask.has_qty() {
            let Some(v) = decode_sleb128(&mut cur)? else {
                return Ok(None);
            };
            qty = v;
        }
        let mut trade_id = 0u64;
        if mask.has_trade_id() {
            let Some(v) = decode_uleb128(&mut cur)? else {
                return Ok(None);
            };
            trade_id = v;
        }
        let mut order_id = 0u64;
        if mask.has_order_id() {
            let Some(v) = decode_uleb128(&mut cur)? else {
                return Ok(None);
            };
            order_id = v;
        }

        *last_px = Some(px);
        let consumed = buf.len() - cur.len();
        Ok(Some((
            TradeSample {
                time_delta,
                mask,
                px,
                qty,
                trade_id,
                order_id,
            },
            consumed,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    // ---------------------------------------------------------------
    // SecondsSample
    // ---------------------------------------------------------------

    #[test]
    fn test_seconds_roundtrip() {
        for sec in [0u32, 1, 3600, 3605, 86_399, MAX_SECONDS] {
            let mut buf = BytesMut::new();
            let n = SecondsSample::new(sec).encode(&mut buf);
            assert_eq!(n, buf.len());
            let (decoded, consumed) = SecondsSample::decode(&buf).unwrap().unwrap();
            assert_eq!(decoded.sec, sec);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn test_seconds_encoded_bytes() {
        let mut buf = BytesMut::new();
        SecondsSample::new(3600).encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x90, 0x1C]);
    }

    #[test]
    fn test_seconds_short_read() {
        let bytes = [0x00u8, 0x90]; // continuation bit set, no terminator
        assert!(SecondsSample::decode(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_seconds_negative_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        crate::varint::encode_sleb128(&mut buf, -5);
        assert!(SecondsSample::decode(&buf).is_err());
    }

    // ---------------------------------------------------------------
    // QuoteSample
    // ---------------------------------------------------------------

    fn encode_quote(delta: bool, time_delta: u32, levels: &[PxLevel], bids: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        QuoteSample::encode(&mut buf, delta, time_delta, levels, bids, levels.len() - bids);
        buf
    }

    #[test]
    fn test_quote_full_roundtrip() {
        // Absolute traversal prices 100,105,110 (bids deepest->best) then
        // 111,116,120 (asks): the writer would difference them like this.
        let wire = [
            PxLevel { px: 100, qty: 10 },
            PxLevel { px: 5, qty: 20 },
            PxLevel { px: 5, qty: 30 },
            PxLevel { px: 1, qty: 20 },
            PxLevel { px: 5, qty: 40 },
            PxLevel { px: 4, qty: 60 },
        ];
        let buf = encode_quote(false, 0, &wire, 3);
        assert_eq!(buf.len(), 16);

        let mut last = None;
        let (quote, consumed) = QuoteSample::decode(&buf, 5, &mut last).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(quote.bid_count, 3);
        assert_eq!(quote.ask_count, 3);
        let abs: Vec<i64> = quote.levels.iter().map(|l| l.px).collect();
        assert_eq!(abs, vec![100, 105, 110, 111, 116, 120]);
        assert_eq!(last, Some(100));

        let bids: Vec<i64> = quote.bids().map(|l| l.px).collect();
        assert_eq!(bids, vec![110, 105, 100]); // descending
        let asks: Vec<i64> = quote.asks().iter().map(|l| l.px).collect();
        assert_eq!(asks, vec![111, 116, 120]); // ascending
    }

    #[test]
    fn test_quote_delta_restores_against_reference() {
        // Reference price 100; delta record moves the anchor to 106.
        let wire = [PxLevel { px: 6, qty: 21 }, PxLevel { px: 5, qty: 31 }];
        let buf = encode_quote(true, 17, &wire, 2);

        let mut last = Some(100i64);
        let (quote, _) = QuoteSample::decode(&buf, 5, &mut last).unwrap().unwrap();
        assert_eq!(quote.time_delta, 17);
        let abs: Vec<i64> = quote.levels.iter().map(|l| l.px).collect();
        assert_eq!(abs, vec![106, 111]);
        assert_eq!(last, Some(106));
    }

    #[test]
    fn test_quote_delta_without_reference_is_format_error() {
        let wire = [PxLevel { px: 6, qty: 21 }];
        let buf = encode_quote(true, 0, &wire, 1);
        let mut last = None;
        assert!(QuoteSample::decode(&buf, 5, &mut last).is_err());
    }

    #[test]
    fn test_quote_depth_limit() {
        let wire: Vec<PxLevel> = (0..6).map(|i| PxLevel { px: i, qty: 1 }).collect();
        let buf = encode_quote(false, 0, &wire, 6);
        let mut last = None;
        // 6 bids with a 5-level limit
        assert!(QuoteSample::decode(&buf, 5, &mut last).is_err());
        // and passes at the limit
        let mut last = None;
        assert!(QuoteSample::decode(&buf, 6, &mut last).unwrap().is_some());
    }

    #[test]
    fn test_quote_short_reads_consume_nothing() {
        let wire = [PxLevel { px: 100, qty: 10 }, PxLevel { px: 5, qty: 20 }];
        let buf = encode_quote(false, 123, &wire, 2);
        for cut in 1..buf.len() {
            let mut last = None;
            let result = QuoteSample::decode(&buf[..cut], 5, &mut last).unwrap();
            assert!(result.is_none(), "cut at {} should need more input", cut);
            assert_eq!(last, None, "cut at {} must not update the reference", cut);
        }
    }

    // ---------------------------------------------------------------
    // FieldMask
    // ---------------------------------------------------------------

    #[test]
    fn test_field_mask_bit_layout() {
        let mask = FieldMask::new(false, Aggr::Aggressor, Side::Buy, true, false, false);
        assert_eq!(mask.0, 0x12);

        let mask = FieldMask::new(true, Aggr::Passive, Side::Sell, true, true, true);
        assert_eq!(mask.0, 0x01 | 0x04 | 0x08 | 0x10 | 0x20 | 0x40);
    }

    #[test]
    fn test_field_mask_accessors() {
        let mask = FieldMask::new(true, Aggr::Passive, Side::Sell, false, true, false);
        assert!(mask.internal());
        assert_eq!(mask.aggr(), Aggr::Passive);
        assert_eq!(mask.side(), Side::Sell);
        assert!(!mask.has_qty());
        assert!(mask.has_trade_id());
        assert!(!mask.has_order_id());
    }

    // ---------------------------------------------------------------
    // TradeSample
    // ---------------------------------------------------------------

    #[test]
    fn test_trade_full_roundtrip() {
        let mask = FieldMask::new(false, Aggr::Aggressor, Side::Buy, true, true, true);
        let mut buf = BytesMut::new();
        TradeSample::encode(&mut buf, false, 250, mask, 10_000, 5, 777, 4242);

        let mut last = None;
        let (trade, consumed) = TradeSample::decode(&buf, &mut last).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(trade.time_delta, 250);
        assert_eq!(trade.px, 10_000);
        assert_eq!(trade.qty, 5);
        assert_eq!(trade.trade_id, 777);
        assert_eq!(trade.order_id, 4242);
        assert_eq!(trade.side(), Side::Buy);
        assert_eq!(trade.aggr(), Aggr::Aggressor);
        assert_eq!(last, Some(10_000));
    }

    #[test]
    fn test_trade_delta_roundtrip() {
        let mask = FieldMask::new(false, Aggr::Undefined, Side::Sell, true, false, false);
        let mut buf = BytesMut::new();
        TradeSample::encode(&mut buf, true, 1, mask, 1, 2, 0, 0);

        let mut last = Some(10_000i64);
        let (trade, _) = TradeSample::decode(&buf, &mut last).unwrap().unwrap();
        assert_eq!(trade.px, 10_001);
        assert_eq!(trade.time_delta, 1);
        assert_eq!(trade.side(), Side::Sell);
        assert_eq!(last, Some(10_001));
    }

    #[test]
    fn test_trade_optional_fields_absent() {
        let mask = FieldMask::new(false, Aggr::Undefined, Side::Buy, false, false, false);
        let mut buf = BytesMut::new();
        let n = TradeSample::encode(&mut buf, false, 0, mask, -3, 0, 0, 0);
        // tag + time + mask + px only
        assert_eq!(n, 4);

        let mut last = None;
        let (trade, _) = TradeSample::decode(&buf, &mut last).unwrap().unwrap();
        assert_eq!(trade.px, -3);
        assert_eq!(trade.qty, 0);
        assert!(!trade.has_qty());
        assert!(!trade.has_trade_id());
        assert!(!trade.has_order_id());
    }

    #[test]
    fn test_trade_short_reads_consume_nothing() {
        let mask = FieldMask::new(false, Aggr::Passive, Side::Sell, true, true, true);
        let mut buf = BytesMut::new();
        TradeSample::encode(&mut buf, false, 999_999, mask, 12345, -7, 1 << 40, 3);
        for cut in 1..buf.len() {
            let mut last = None;
            let result = TradeSample::decode(&buf[..cut], &mut last).unwrap();
            assert!(result.is_none(), "cut at {} should need more input", cut);
            assert_eq!(last, None);
        }
    }

    #[test]
    fn test_trade_delta_without_reference_is_format_error() {
        let mask = FieldMask::new(false, Aggr::Undefined, Side::Buy, false, false, false);
        let mut buf = BytesMut::new();
        TradeSample::encode(&mut buf, true, 0, mask, 1, 0, 0, 0);
        let mut last = None;
        assert!(TradeSample::decode(&buf, &mut last).is_err());
    }
}

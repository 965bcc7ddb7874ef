//! Stream kinds, trade attributes, and price-unit conversion.
//!
//! Prices inside an SDB file are always signed step counts: an integer
//! multiple of the header's price step. Callers work in whatever unit is
//! convenient — raw steps, a scaled integer, or a float — and [`ToSteps`]
//! normalizes at the API boundary, mirroring how the header-derived
//! scale/precision pair is used everywhere else in the format.

use crate::{Error, Result};

/// Kinds of stream records. The kind is the low 7 bits of a record's first
/// byte; the high bit is the delta flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamType {
    /// Whole-second anchor records. Mandatory in every file.
    Seconds = 0,
    Quotes = 1,
    Trade = 2,
    /// Reserved, not defined in format version 1.
    Order = 3,
    /// Reserved, not defined in format version 1.
    Summary = 4,
    /// Reserved, not defined in format version 1.
    Message = 5,
}

impl TryFrom<u8> for StreamType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StreamType::Seconds),
            1 => Ok(StreamType::Quotes),
            2 => Ok(StreamType::Trade),
            3 => Ok(StreamType::Order),
            4 => Ok(StreamType::Summary),
            5 => Ok(StreamType::Message),
            _ => Err(Error::Format(format!("invalid stream type {}", value))),
        }
    }
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_char(self) -> char {
        match self {
            Side::Buy => 'B',
            Side::Sell => 'S',
        }
    }
}

/// Which side of a trade removed liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Aggr {
    Undefined = 0,
    Aggressor = 1,
    Passive = 2,
}

impl Aggr {
    pub fn as_char(self) -> char {
        match self {
            Aggr::Undefined => ' ',
            Aggr::Aggressor => 'A',
            Aggr::Passive => 'P',
        }
    }
}

/// One price level as supplied by a caller, in an arbitrary price unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel<P> {
    pub px: P,
    pub qty: i64,
}

impl<P> BookLevel<P> {
    pub fn new(px: P, qty: i64) -> Self {
        Self { px, qty }
    }
}

/// Price conversion table derived from the header's price step.
///
/// `scale = round(1/step)`, `precision = log10(scale)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PxConv {
    pub step: f64,
    pub scale: i64,
    pub precision: u32,
}

impl PxConv {
    pub fn from_step(step: f64) -> Self {
        let scale = if step != 0.0 { (1.0 / step + 0.5) as i64 } else { 0 };
        let precision = if scale > 0 {
            (scale as f64).log10().round() as u32
        } else {
            0
        };
        Self { step, scale, precision }
    }

    /// Convert a step-count price back to a floating-point price.
    pub fn to_f64(&self, steps: i64) -> f64 {
        steps as f64 * self.step
    }
}

/// Normalization of a caller-side price into step counts.
pub trait ToSteps {
    fn to_steps(&self, conv: &PxConv) -> i64;
}

/// A price already expressed in step counts. Passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Steps(pub i64);

impl ToSteps for Steps {
    fn to_steps(&self, _conv: &PxConv) -> i64 {
        self.0
    }
}

/// A scaled integer price: `Scaled(v, p)` means `v * 10^-p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scaled(pub i64, pub u32);

impl ToSteps for Scaled {
    fn to_steps(&self, conv: &PxConv) -> i64 {
        let Scaled(value, precision) = *self;
        if conv.precision >= precision {
            value * 10i64.pow(conv.precision - precision)
        } else {
            let divisor = 10i64.pow(precision - conv.precision);
            // round to nearest step
            (value + divisor / 2).div_euclid(divisor)
        }
    }
}

impl ToSteps for f64 {
    fn to_steps(&self, conv: &PxConv) -> i64 {
        (*self / conv.step).round() as i64
    }
}

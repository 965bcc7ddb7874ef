//! Text file header.
//!
//! An SDB file opens with a human-readable, line-oriented header terminated
//! by a blank line:
//!
//! ```text
//! #!/usr/bin/env sdb
//! version:  1
//! utc-date: 2015-10-15 (+0900 KST)
//! exchange: KRX
//! symbol:   KR4101
//! instr:    KR4101K60008
//! secid:    1
//! depth:    5
//! px-step:  0.01
//! uuid:     0f7f69c9-fc9d-4517-8318-706e3e58dadd
//!
//! ```
//!
//! All values are ASCII with no embedded newlines. The date is the UTC
//! midnight of the file's logical day; the parenthesized group carries the
//! venue's local-time offset and zone name. The price step determines the
//! derived scale (`round(1/step)`) and precision (`log10(scale)`) used for
//! every price in the file. The parser tolerates unknown extra lines between
//! `uuid` and the terminating blank line.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use sdb_core::types::PxConv;
use sdb_core::{Error, Result};

/// First line of every SDB file.
pub const SHEBANG: &str = "#!/usr/bin/env sdb";

/// No well-formed file is smaller than this (header plus empty metadata).
pub const MIN_FILE_SIZE: u64 = 165;

/// Parsed file header. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: u32,
    pub exchange: String,
    pub symbol: String,
    pub instrument: String,
    pub secid: i64,
    /// UTC midnight of the file's logical day.
    pub date: DateTime<Utc>,
    pub tz_name: String,
    pub tz_offset_secs: i32,
    pub depth: u8,
    pub px_step: f64,
    /// Derived from `px_step`.
    pub conv: PxConv,
    pub uuid: Uuid,
}

impl Header {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u32,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        instrument: impl Into<String>,
        secid: i64,
        date: DateTime<Utc>,
        tz_name: impl Into<String>,
        tz_offset_secs: i32,
        depth: u8,
        px_step: f64,
        uuid: Uuid,
    ) -> Self {
        let midnight = date
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        Self {
            version,
            exchange: exchange.into(),
            symbol: symbol.into(),
            instrument: instrument.into(),
            secid,
            date: midnight,
            tz_name: tz_name.into(),
            tz_offset_secs,
            depth,
            px_step,
            conv: PxConv::from_step(px_step),
            uuid,
        }
    }

    /// UTC midnight of the file's date.
    pub fn midnight(&self) -> DateTime<Utc> {
        self.date
    }

    /// The `±HHMM TZNAME` group as written into the header.
    pub fn tz(&self) -> String {
        let sign = if self.tz_offset_secs < 0 { '-' } else { '+' };
        let n = self.tz_offset_secs.unsigned_abs();
        format!("{}{:02}{:02} {}", sign, n / 3600, n % 3600 / 60, self.tz_name)
    }

    /// Write the header, returning the number of bytes emitted.
    pub fn write(&self, w: &mut impl Write) -> Result<usize> {
        let px_prec = self.conv.precision as usize;
        let text = format!(
            "{shebang}\n\
             version:  {version}\n\
             utc-date: {date} ({tz})\n\
             exchange: {exchange}\n\
             symbol:   {symbol}\n\
             instr:    {instr}\n\
             secid:    {secid}\n\
             depth:    {depth}\n\
             px-step:  {px_step:.px_prec$}\n\
             uuid:     {uuid}\n\n",
            shebang = SHEBANG,
            version = self.version,
            date = self.date.format("%Y-%m-%d"),
            tz = self.tz(),
            exchange = self.exchange,
            symbol = self.symbol,
            instr = self.instrument,
            secid = self.secid,
            depth = self.depth,
            px_step = self.px_step,
            uuid = self.uuid,
        );
        w.write_all(text.as_bytes())?;
        Ok(text.len())
    }

    /// Read and parse the header from the start of `file`, leaving the file
    /// positioned at the first byte after the terminating blank line.
    /// Returns the header and that position.
    pub fn read(file: &mut File) -> Result<(Header, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut rdr = BufReader::new(&mut *file);
        let mut lines: Vec<String> = Vec::new();
        let mut consumed: u64 = 0;
        loop {
            let mut line = String::new();
            let n = rdr.read_line(&mut line)?;
            if n == 0 {
                return Err(Error::Format(
                    "header not terminated by a blank line".to_string(),
                ));
            }
            consumed += n as u64;
            if consumed > 64 * 1024 {
                return Err(Error::Format("header too large".to_string()));
            }
            if line == "\n" {
                break;
            }
            lines.push(line.trim_end_matches('\n').to_string());
        }
        drop(rdr);
        // BufReader read ahead; put the file back to the header boundary.
        file.seek(SeekFrom::Start(consumed))?;
        Ok((Self::parse(&lines)?, consumed))
    }

    fn parse(lines: &[String]) -> Result<Header> {
        if lines.first().map(String::as_str) != Some(SHEBANG) {
            return Err(Error::Format("missing SDB shebang line".to_string()));
        }

        fn field<'a>(lines: &'a [String], idx: usize, key: &str) -> Result<&'a str> {
            let line = lines
                .get(idx)
                .ok_or_else(|| Error::Format(format!("missing header field '{}'", key)))?;
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| Error::Format(format!("malformed header line '{}'", line)))?;
            if k != key {
                return Err(Error::Format(format!(
                    "expected header field '{}', found '{}'",
                    key, k
                )));
            }
            Ok(v.trim())
        }

        let version: u32 = field(lines, 1, "version")?
            .parse()
            .map_err(|_| Error::Format("invalid version".to_string()))?;

        let (date, tz_name, tz_offset_secs) = Self::parse_date(field(lines, 2, "utc-date")?)?;

        let exchange = field(lines, 3, "exchange")?.to_string();
        let symbol = field(lines, 4, "symbol")?.to_string();
        let instrument = field(lines, 5, "instr")?.to_string();
        let secid: i64 = field(lines, 6, "secid")?
            .parse()
            .map_err(|_| Error::Format("invalid secid".to_string()))?;
        let depth: u8 = field(lines, 7, "depth")?
            .parse()
            .map_err(|_| Error::Format("invalid depth".to_string()))?;
        let px_step: f64 = field(lines, 8, "px-step")?
            .parse()
            .map_err(|_| Error::Format("invalid px-step".to_string()))?;
        if !(px_step > 0.0) {
            return Err(Error::Format(format!("px-step must be positive: {}", px_step)));
        }
        let uuid = Uuid::parse_str(field(lines, 9, "uuid")?)
            .map_err(|_| Error::Format("invalid uuid".to_string()))?;
        // Lines past `uuid` are tolerated and ignored.

        Ok(Header::new(
            version, exchange, symbol, instrument, secid, date, tz_name, tz_offset_secs, depth,
            px_step, uuid,
        ))
    }

    /// Parse `YYYY-MM-DD (±HHMM TZNAME)`.
    fn parse_date(value: &str) -> Result<(DateTime<Utc>, String, i32)> {
        let bad = || Error::Format(format!("invalid utc-date value '{}'", value));

        let (date_str, rest) = value.split_once(" (").ok_or_else(bad)?;
        let inner = rest.strip_suffix(')').ok_or_else(bad)?;
        let (offset_str, tz_name) = inner.split_once(' ').ok_or_else(bad)?;

        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .map_err(|_| bad())?
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();

        let bytes = offset_str.as_bytes();
        if bytes.len() != 5
            || (bytes[0] != b'+' && bytes[0] != b'-')
            || !offset_str[1..].bytes().all(|b| b.is_ascii_digit())
        {
            return Err(Error::Format(format!(
                "invalid timezone offset '{}'",
                offset_str
            )));
        }
        let hh: i32 = offset_str[1..3].parse().map_err(|_| bad())?;
        let mm: i32 = offset_str[3..5].parse().map_err(|_| bad())?;
        let sign = if bytes[0] == b'-' { -1 } else { 1 };
        let offset = sign * (hh * 3600 + mm * 60);

        if tz_name.is_empty() {
            return Err(bad());
        }

        Ok((date, tz_name.to_string(), offset))
    }
}

//! File naming convention.
//!
//! Flat layout (the default):
//!
//! ```text
//! <base>/<YYYY><MM><DD>.<exchange>.<symbol>.<instrument>.sdb
//! ```
//!
//! Nested layout (`deep_dir`):
//!
//! ```text
//! <base>/<exchange>/<symbol>/<YYYY>/<MM>/<instrument>.<YYYYMMDD>.sdb
//! ```
//!
//! Slash characters inside an instrument name (futures spreads and the
//! like) are rewritten to hyphens before the name reaches a path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

use crate::config::FileConfig;

pub const SUFFIX: &str = "sdb";

/// Build the path for one (exchange, symbol, instrument, date) tuple.
pub fn filename(
    base_dir: &Path,
    deep_dir: bool,
    exchange: &str,
    symbol: &str,
    instrument: &str,
    date: DateTime<Utc>,
) -> PathBuf {
    let instr = instrument.replace('/', "-");
    let (y, m, d) = (date.year(), date.month(), date.day());
    if deep_dir {
        base_dir
            .join(exchange)
            .join(symbol)
            .join(format!("{:04}", y))
            .join(format!("{:02}", m))
            .join(format!("{}.{:04}{:02}{:02}.{}", instr, y, m, d, SUFFIX))
    } else {
        base_dir.join(format!(
            "{:04}{:02}{:02}.{}.{}.{}.{}",
            y, m, d, exchange, symbol, instr, SUFFIX
        ))
    }
}

/// Path for a writer configuration.
pub fn config_filename(config: &FileConfig) -> PathBuf {
    filename(
        &config.base_dir,
        config.deep_dir,
        &config.exchange,
        &config.symbol,
        &config.instrument,
        config.date,
    )
}

//! Writer configuration.
//!
//! Everything the writer needs to place and stamp a new file: the identity
//! tuple (exchange, symbol, instrument, security id, UTC date), the venue
//! time zone, book depth, price step, and filesystem details. Serializable
//! so capture jobs can keep their parameters in plain config files.
//!
//! ## Usage
//!
//! ```ignore
//! use sdb_storage::FileConfig;
//!
//! let config = FileConfig {
//!     base_dir: "/data/sdb".into(),
//!     exchange: "KRX".to_string(),
//!     symbol: "KR4101".to_string(),
//!     instrument: "KR4101K60008".to_string(),
//!     secid: 1,
//!     date: "2015-10-15T00:00:00Z".parse().unwrap(),
//!     tz_name: "KST".to_string(),
//!     tz_offset_secs: 9 * 3600,
//!     ..FileConfig::default()
//! };
//! let mut writer = SdbWriter::create(&config)?;
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sdb_core::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Root directory the file is created under.
    pub base_dir: PathBuf,

    /// Use the nested `<exchange>/<symbol>/<year>/<month>/` directory tree
    /// instead of a flat filename (default: false).
    #[serde(default)]
    pub deep_dir: bool,

    /// Exchange name (ASCII, no path separators).
    pub exchange: String,

    /// Company-specific security name.
    pub symbol: String,

    /// Exchange-specific security name.
    pub instrument: String,

    /// Positive numeric security id.
    pub secid: i64,

    /// UTC date of the file; normalized to midnight.
    pub date: DateTime<Utc>,

    /// Short venue time-zone name, e.g. "KST".
    pub tz_name: String,

    /// Venue offset from UTC in seconds.
    #[serde(default)]
    pub tz_offset_secs: i32,

    /// Book depth per side (default: 5).
    #[serde(default = "default_depth")]
    pub depth: u8,

    /// Minimal price increment (default: 0.0001).
    #[serde(default = "default_px_step")]
    pub px_step: f64,

    /// Permissions for newly created files (default: 0o640).
    #[serde(default = "default_file_permissions")]
    pub file_permissions: u32,

    /// File identity; freshly generated when omitted.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            deep_dir: false,
            exchange: String::new(),
            symbol: String::new(),
            instrument: String::new(),
            secid: 0,
            date: DateTime::<Utc>::UNIX_EPOCH,
            tz_name: "UTC".to_string(),
            tz_offset_secs: 0,
            depth: default_depth(),
            px_step: default_px_step(),
            file_permissions: default_file_permissions(),
            uuid: Uuid::new_v4(),
        }
    }
}

fn default_depth() -> u8 {
    5
}

fn default_px_step() -> f64 {
    0.0001
}

fn default_file_permissions() -> u32 {
    0o640
}

impl FileConfig {
    /// Check the identity tuple before any file is touched.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("exchange", &self.exchange),
            ("symbol", &self.symbol),
            ("instrument", &self.instrument),
            ("tz_name", &self.tz_name),
        ] {
            if value.is_empty() {
                return Err(Error::Format(format!("{} must not be empty", name)));
            }
            if !value.is_ascii() || value.contains(|c: char| c.is_whitespace() || c == '\n') {
                return Err(Error::Format(format!(
                    "{} must be ASCII without whitespace: {:?}",
                    name, value
                )));
            }
        }
        for (name, value) in [("exchange", &self.exchange), ("symbol", &self.symbol)] {
            if value.contains('/') {
                return Err(Error::Format(format!(
                    "{} must not contain path separators: {:?}",
                    name, value
                )));
            }
        }
        if self.secid <= 0 {
            return Err(Error::Format(format!(
                "secid must be positive: {}",
                self.secid
            )));
        }
        if self.depth == 0 || self.depth > 127 {
            return Err(Error::Format(format!(
                "depth must be in 1..=127: {}",
                self.depth
            )));
        }
        if !(self.px_step > 0.0) {
            return Err(Error::Format(format!(
                "px_step must be positive: {}",
                self.px_step
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> FileConfig {
        FileConfig {
            base_dir: PathBuf::from("/tmp"),
            exchange: "KRX".to_string(),
            symbol: "KR4101".to_string(),
            instrument: "KR4101K60008".to_string(),
            secid: 1,
            date: "2015-10-15T00:00:00Z".parse().unwrap(),
            tz_name: "KST".to_string(),
            tz_offset_secs: 9 * 3600,
            ..FileConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = FileConfig::default();
        assert_eq!(cfg.depth, 5);
        assert_eq!(cfg.px_step, 0.0001);
        assert_eq!(cfg.file_permissions, 0o640);
        assert!(!cfg.deep_dir);
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_and_bad_fields() {
        let mut cfg = sample_config();
        cfg.exchange = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.symbol = "A B".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.secid = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.depth = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.depth = 128;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.px_step = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.exchange = "K/RX".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip_with_defaults() {
        let json = r#"{
            "base_dir": "/data/sdb",
            "exchange": "KRX",
            "symbol": "KR4101",
            "instrument": "KR4101K60008",
            "secid": 1,
            "date": "2015-10-15T00:00:00Z",
            "tz_name": "KST",
            "tz_offset_secs": 32400
        }"#;
        let cfg: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.depth, 5);
        assert_eq!(cfg.px_step, 0.0001);
        assert_eq!(cfg.file_permissions, 0o640);
        assert!(!cfg.uuid.is_nil());

        let text = serde_json::to_string(&cfg).unwrap();
        let back: FileConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.exchange, cfg.exchange);
        assert_eq!(back.uuid, cfg.uuid);
        assert_eq!(back.date, cfg.date);
    }
}

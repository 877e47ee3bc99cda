use std::time::Duration;

use crate::{
    document_db::DocumentDb,
    error::{Error, Result},
};

pub const KEY_ENABLE_BARCODES: &str = "consumer_enable_barcodes";
pub const KEY_BARCODE_STRING: &str = "consumer_barcode_string";
pub const KEY_INDEX_WRITER_MEMORY: &str = "index_writer_memory";
pub const KEY_INDEX_WRITER_TIMEOUT: &str = "index_writer_timeout_secs";

/// Every key understood by [`Settings::load`].
pub const KNOWN_KEYS: &[&str] = &[
    KEY_ENABLE_BARCODES,
    KEY_BARCODE_STRING,
    KEY_INDEX_WRITER_MEMORY,
    KEY_INDEX_WRITER_TIMEOUT,
];

pub const DEFAULT_BARCODE_STRING: &str = "PATCHT";
/// Tantivy refuses writer budgets below 15MB per thread.
pub const DEFAULT_INDEX_WRITER_MEMORY: usize = 15_000_000;
pub const DEFAULT_INDEX_WRITER_TIMEOUT_SECS: u64 = 30;

/// Runtime settings for the task entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub enable_barcodes: bool,
    pub barcode_string: String,
    pub index_writer_memory: usize,
    pub index_writer_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_barcodes: false,
            barcode_string: DEFAULT_BARCODE_STRING.to_string(),
            index_writer_memory: DEFAULT_INDEX_WRITER_MEMORY,
            index_writer_timeout: Duration::from_secs(
                DEFAULT_INDEX_WRITER_TIMEOUT_SECS,
            ),
        }
    }
}

impl Settings {
    /// Resolve every setting from, in order of priority:
    /// 1. The `DOCVAULT_<KEY>` environment variable
    /// 2. The settings table in the document database
    /// 3. The built-in default
    pub fn load(db: &DocumentDb) -> Result<Self> {
        Self::load_with(|key| {
            if let Ok(val) = std::env::var(env_var_name(key)) {
                return Ok(Some(val));
            }
            db.get_setting(key)
        })
    }

    fn load_with<F>(mut lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<Option<String>>,
    {
        let defaults = Self::default();

        let enable_barcodes = match lookup(KEY_ENABLE_BARCODES)? {
            Some(v) => parse_bool(KEY_ENABLE_BARCODES, &v)?,
            None => defaults.enable_barcodes,
        };
        let barcode_string = lookup(KEY_BARCODE_STRING)?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.barcode_string);
        let index_writer_memory = match lookup(KEY_INDEX_WRITER_MEMORY)? {
            Some(v) => parse_number(KEY_INDEX_WRITER_MEMORY, &v)?,
            None => defaults.index_writer_memory,
        };
        let index_writer_timeout = match lookup(KEY_INDEX_WRITER_TIMEOUT)? {
            Some(v) => {
                Duration::from_secs(parse_number(KEY_INDEX_WRITER_TIMEOUT, &v)?)
            }
            None => defaults.index_writer_timeout,
        };

        Ok(Self {
            enable_barcodes,
            barcode_string,
            index_writer_memory,
            index_writer_timeout,
        })
    }
}

pub fn env_var_name(key: &str) -> String {
    format!("DOCVAULT_{}", key.to_ascii_uppercase())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "invalid boolean for {key}: '{other}'"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!("invalid number for {key}: '{value}'"))
    })
}

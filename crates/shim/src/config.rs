//! Manifest configuration store.
//!
//! Keys are dotted strings (`sys.brk.max_size`), values are kept as the raw
//! manifest text; typed accessors parse on lookup. Reading the manifest file
//! itself is the loader's job, this module only sees its contents.

use alloc::string::{String, ToString};

use graft_error::define_shim_error;
use graft_utils::HashMap;
use linux_raw_sys::errno::{EINVAL, ERANGE};

define_shim_error! {
    /// Manifest parsing errors.
    pub enum ConfigError(0x03) {
        /// Line is neither a comment nor `key = value`
        Malformed = 0x01, EINVAL => "Malformed manifest line",
        /// Value is not a number
        InvalidNumber = 0x02, EINVAL => "Invalid numeric value",
        /// Value does not fit in 64 bits
        Overflow = 0x03, ERANGE => "Numeric value out of range",
    }
}

/// Parsed manifest.
#[derive(Debug, Default, Clone)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key = value` lines. Blank lines and `#` comments are skipped,
    /// values may be wrapped in double quotes.
    pub fn from_manifest(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::Malformed)?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Malformed);
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            config.insert(key, value);
        }
        Ok(config)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Look up `key` and parse it with [`parse_size`].
    pub fn get_size(&self, key: &str) -> Option<Result<u64, ConfigError>> {
        self.get(key).map(parse_size)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse an integer with an optional binary unit suffix.
///
/// Accepts decimal or `0x` hexadecimal digits followed by `K`, `M` or `G`
/// (case-insensitive), e.g. `256K`, `0x4000`, `64M`.
pub fn parse_size(text: &str) -> Result<u64, ConfigError> {
    let text = text.trim();
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'k' | b'K') => (&text[..text.len() - 1], 10),
        Some(b'm' | b'M') => (&text[..text.len() - 1], 20),
        Some(b'g' | b'G') => (&text[..text.len() - 1], 30),
        Some(_) => (text, 0),
        None => return Err(ConfigError::InvalidNumber),
    };

    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| ConfigError::InvalidNumber)?;

    value
        .checked_mul(1u64 << shift)
        .ok_or(ConfigError::Overflow)
}

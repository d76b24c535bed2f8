//! # Request and Reply Types
//!
//! Purpose: Strongly typed verbs, store options, fetched entries and stats
//! records shared by the codec and the client facade.
//!
//! ## Design Principles
//! 1. **Explicit Options**: Store calls take a `StoreOptions` struct with
//!    independently optional fields instead of an untyped option bag.
//! 2. **Fail Fast**: Keys and expirations are validated before any byte is
//!    written, so invalid requests never cost a round trip.
//! 3. **Ordered Stats**: Stats are kept in `BTreeMap`s so snapshots print and
//!    compare deterministically.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::adapter::Value;
use crate::error::{ErrorKind, McError, McResult};

/// Longest key the server accepts, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest relative expiration the server accepts (30 days, in seconds).
pub const MAX_EXPIRATION: u32 = 2_592_000;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// Host used when an address omits one.
pub const DEFAULT_HOST: &str = "localhost";

/// Checks that a key can be framed on a command line.
///
/// # Errors
/// Returns a `CLIENT_ERROR` when the key is empty, longer than
/// `MAX_KEY_LENGTH`, or contains whitespace/control characters.
pub fn validate_key(key: &str) -> McResult<()> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(McError::new(
            ErrorKind::Client,
            format!("Key too long, max {} char", MAX_KEY_LENGTH),
        ));
    }
    if key.is_empty() {
        return Err(McError::new(ErrorKind::Client, "Key must not be empty"));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(McError::new(
            ErrorKind::Client,
            "Key must not contain whitespace or control characters",
        ));
    }
    Ok(())
}

/// Checks an expiration against the 30 day protocol limit.
pub fn validate_expiration(seconds: u32) -> McResult<()> {
    if seconds > MAX_EXPIRATION {
        return Err(McError::new(
            ErrorKind::InvalidExpiration,
            format!("Value {} exceeds max of {}", seconds, MAX_EXPIRATION),
        ));
    }
    Ok(())
}

/// Storage command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreVerb {
    pub const fn as_str(self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Replace => "replace",
            StoreVerb::Append => "append",
            StoreVerb::Prepend => "prepend",
            StoreVerb::Cas => "cas",
        }
    }
}

impl fmt::Display for StoreVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrieveVerb {
    Get,
    /// Like `Get`, but replies carry the cas token.
    Gets,
}

impl RetrieveVerb {
    pub const fn as_str(self) -> &'static str {
        match self {
            RetrieveVerb::Get => "get",
            RetrieveVerb::Gets => "gets",
        }
    }
}

/// Arithmetic command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterVerb {
    Incr,
    Decr,
}

impl CounterVerb {
    pub const fn as_str(self) -> &'static str {
        match self {
            CounterVerb::Incr => "incr",
            CounterVerb::Decr => "decr",
        }
    }
}

/// `stats` sub-commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum StatsKind {
    #[default]
    General,
    Items,
    Slabs,
    Sizes,
    /// Any other sub-command; decoded like `General`.
    Other(String),
}

impl StatsKind {
    pub fn as_str(&self) -> &str {
        match self {
            StatsKind::General => "",
            StatsKind::Items => "items",
            StatsKind::Slabs => "slabs",
            StatsKind::Sizes => "sizes",
            StatsKind::Other(name) => name,
        }
    }
}

/// Optional per-call store settings; unset fields fall back to client defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Expiration in seconds; `None` uses the client's time-to-live.
    pub expiration: Option<u32>,
    /// Opaque flags; `None` stores 0.
    pub flags: Option<u32>,
    /// Cas token; required by `cas`, ignored by the other verbs' servers.
    pub cas: Option<u64>,
}

impl StoreOptions {
    pub fn new() -> Self {
        StoreOptions::default()
    }

    pub fn expiration(mut self, seconds: u32) -> Self {
        self.expiration = Some(seconds);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn cas(mut self, token: u64) -> Self {
        self.cas = Some(token);
        self
    }
}

/// One fetched key.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Adapted value.
    pub value: Value,
    pub flags: u32,
    /// Present only for `gets` replies.
    pub cas: Option<u64>,
}

/// Fetch result keyed by the requested key.
pub type Values = HashMap<String, Entry>;

/// Parsed `stats` reply.
///
/// Global metrics live in `fields`; metrics reported per slab class
/// (`<slab>:<metric>`) are nested under their numeric slab id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsRecord {
    pub fields: BTreeMap<String, String>,
    pub slabs: BTreeMap<u32, BTreeMap<String, String>>,
}

impl StatsRecord {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn slab(&self, id: u32) -> Option<&BTreeMap<String, String>> {
        self.slabs.get(&id)
    }

    pub(crate) fn insert_slab(&mut self, id: u32, metric: &str, value: &str) {
        self.slabs
            .entry(id)
            .or_default()
            .insert(metric.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_key_at_limit() {
        let key = "k".repeat(MAX_KEY_LENGTH);
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn rejects_long_key() {
        let key = "k".repeat(MAX_KEY_LENGTH + 1);
        let err = validate_key(&key).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Client);
        assert_eq!(err.description, "Key too long, max 250 char");
    }

    #[test]
    fn rejects_unframeable_keys() {
        assert!(validate_key("").is_err());
        assert!(validate_key("two words").is_err());
        assert!(validate_key("line\r\nbreak").is_err());
    }

    #[test]
    fn expiration_limit_is_inclusive() {
        assert!(validate_expiration(MAX_EXPIRATION).is_ok());
        let err = validate_expiration(MAX_EXPIRATION + 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidExpiration);
    }

    #[test]
    fn store_options_builder() {
        let opts = StoreOptions::new().expiration(60).flags(3).cas(99);
        assert_eq!(opts.expiration, Some(60));
        assert_eq!(opts.flags, Some(3));
        assert_eq!(opts.cas, Some(99));
    }
}

//! Trace and request identifier generation
//!
//! Generated identifiers have the form `<prefix>-<base36 millis>-<random>`:
//!
//! ```rust
//! use grpc_bridge::ids::{IdGenerator, PrefixedIdGenerator};
//!
//! let ids = PrefixedIdGenerator::new("grpc");
//! let trace_id = ids.generate();
//! assert!(trace_id.starts_with("grpc-"));
//! ```
//!
//! The timestamp segment keeps identifiers roughly time-sortable within a
//! prefix; the 64-bit random suffix keeps them unique across concurrent calls.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;

/// Prefix used for generated request identifiers
pub const REQUEST_ID_PREFIX: &str = "req";

/// Source of identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce a new identifier
    fn generate(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

/// Shared, type-erased identifier generator
pub type SharedIdGenerator = Arc<dyn IdGenerator>;

/// Built-in generator producing `<prefix>-<base36 millis>-<random>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixedIdGenerator {
    prefix: String,
}

impl PrefixedIdGenerator {
    /// Create a generator for the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generator for request identifiers (`req-...`)
    pub fn request() -> Self {
        Self::new(REQUEST_ID_PREFIX)
    }

    /// The configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl IdGenerator for PrefixedIdGenerator {
    fn generate(&self) -> String {
        let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let suffix: u64 = rand::rng().random();
        format!("{}-{}-{}", self.prefix, to_base36(millis), to_base36(suffix))
    }
}

impl fmt::Display for PrefixedIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-<timestamp>-<random>", self.prefix)
    }
}

/// Encode a number using lowercase base36 digits
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut buf = Vec::with_capacity(13);
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// Check whether `id` looks like an identifier produced for `prefix`
pub fn matches_generated_pattern(id: &str, prefix: &str) -> bool {
    let Some(rest) = id.strip_prefix(prefix).and_then(|r| r.strip_prefix('-')) else {
        return false;
    };
    let mut parts = rest.split('-');
    let (Some(timestamp), Some(random), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let is_base36 =
        |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase());
    is_base36(timestamp) && is_base36(random)
}

//! Call metadata as plain strings
//!
//! tonic exposes headers as ASCII or binary values; the request context keeps
//! a simplified, ordered view where every header is either a single string or
//! a list of strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tonic::metadata::{KeyAndValueRef, MetadataMap};

/// Canonical trace id header
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Canonical request id header
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Canonical user id header
pub const USER_ID_HEADER: &str = "x-user-id";
/// Authorization header
pub const AUTHORIZATION_HEADER: &str = "authorization";
/// Correlation id header
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// A header value: one string or several
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Header sent once
    Single(String),
    /// Header sent several times
    Multiple(Vec<String>),
}

impl MetadataValue {
    /// First value of the header
    pub fn first(&self) -> Option<&str> {
        match self {
            MetadataValue::Single(v) => Some(v.as_str()),
            MetadataValue::Multiple(values) => values.first().map(String::as_str),
        }
    }

    /// All values of the header
    pub fn values(&self) -> Vec<&str> {
        match self {
            MetadataValue::Single(v) => vec![v.as_str()],
            MetadataValue::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            MetadataValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = MetadataValue::Multiple(vec![first, value]);
            }
            MetadataValue::Multiple(values) => values.push(value),
        }
    }
}

/// Ordered header map with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a tonic metadata map. Binary values are decoded as UTF-8 text.
    pub fn from_metadata_map(map: &MetadataMap) -> Self {
        let mut metadata = Self::new();
        for entry in map.iter() {
            match entry {
                KeyAndValueRef::Ascii(key, value) => {
                    let text = match value.to_str() {
                        Ok(s) => s.to_string(),
                        Err(_) => String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
                    };
                    metadata.append(key.as_str(), text);
                }
                KeyAndValueRef::Binary(key, value) => {
                    let text = match value.to_bytes() {
                        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        Err(_) => String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
                    };
                    metadata.append(key.as_str(), text);
                }
            }
        }
        metadata
    }

    /// Add a value, turning the entry into a list if the header already exists
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let value = value.into();
        match self.0.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.0.insert(key, MetadataValue::Single(value));
            }
        }
    }

    /// Replace a header
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .insert(key.to_ascii_lowercase(), MetadataValue::Single(value.into()));
    }

    /// Look up a header
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(&key.to_ascii_lowercase())
    }

    /// First value of a header, ignoring empty strings
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(MetadataValue::first)
            .filter(|v| !v.is_empty())
    }

    /// Whether a header is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterate headers in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of distinct headers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Header names consulted by the context factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNames {
    /// Trace id header
    #[serde(default = "default_trace_id_header")]
    pub trace_id: String,
    /// Request id header
    #[serde(default = "default_request_id_header")]
    pub request_id: String,
    /// User id header
    #[serde(default = "default_user_id_header")]
    pub user_id: String,
    /// Authorization header
    #[serde(default = "default_authorization_header")]
    pub authorization: String,
    /// Correlation id header
    #[serde(default = "default_correlation_id_header")]
    pub correlation_id: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            trace_id: default_trace_id_header(),
            request_id: default_request_id_header(),
            user_id: default_user_id_header(),
            authorization: default_authorization_header(),
            correlation_id: default_correlation_id_header(),
        }
    }
}

fn default_trace_id_header() -> String {
    TRACE_ID_HEADER.to_string()
}

fn default_request_id_header() -> String {
    REQUEST_ID_HEADER.to_string()
}

fn default_user_id_header() -> String {
    USER_ID_HEADER.to_string()
}

fn default_authorization_header() -> String {
    AUTHORIZATION_HEADER.to_string()
}

fn default_correlation_id_header() -> String {
    CORRELATION_ID_HEADER.to_string()
}

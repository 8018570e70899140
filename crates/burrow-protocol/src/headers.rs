//! Message header values.

use std::collections::HashMap;
use std::fmt;

/// Headers attached to an outgoing or incoming message.
pub type HeaderMap = HashMap<String, HeaderValue>;

/// A header value.
///
/// Only string values are surfaced to handlers; every other variant reads as
/// an empty string there.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// UTF-8 string.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Any value the transport cannot represent more precisely.
    Other,
}

impl HeaderValue {
    /// Get the value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The string form handed to handlers.
    #[must_use]
    pub fn to_handler_string(&self) -> String {
        self.as_str().unwrap_or_default().to_string()
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::String(s) => write!(f, "{s}"),
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Float(x) => write!(f, "{x}"),
            HeaderValue::Bool(b) => write!(f, "{b}"),
            HeaderValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            HeaderValue::Other => write!(f, "<other>"),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::String(s)
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::String(s.to_string())
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl From<f64> for HeaderValue {
    fn from(x: f64) -> Self {
        HeaderValue::Float(x)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Bool(b)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(b: Vec<u8>) -> Self {
        HeaderValue::Bytes(b)
    }
}

/// Flatten headers into the string map handed to handlers.
#[must_use]
pub fn to_string_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), v.to_handler_string()))
        .collect()
}

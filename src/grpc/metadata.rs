//! Metadata Codec.
//!
//! Translates header and trailer sets between the client-facing transport and
//! the backend call.
//!
//! # Rules
//! - Transport-managed keys are dropped in both directions. Each hop injects
//!   its own content negotiation and connection headers.
//! - Keys ending in `-bin` carry base64 text on the client side and raw bytes
//!   on the backend side. Relaying back to the client re-encodes them without
//!   `=` padding.
//! - A binary value whose decoded form is empty is dropped rather than
//!   forwarded. Downstream transports have been seen to mishandle empty binary
//!   headers and callers may depend on their absence.
//!
//! Both direction transforms are pure functions of their input.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Suffix marking a binary-valued metadata key.
pub const BINARY_SUFFIX: &str = "-bin";

/// Keys owned by the transport on either hop.
const TRANSPORT_MANAGED: &[&str] = &[
    "content-type",
    "content-length",
    "te",
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "trailer",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-status",
    "grpc-message",
];

/// Accepts padded and unpadded input; clients differ.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Value attached to a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    Binary(Bytes),
}

/// Ordered multimap of lower-cased keys to values.
///
/// Keys are compared case-insensitively by normalising on insert. Duplicate
/// keys are kept in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata<V> {
    entries: Vec<(String, V)>,
}

/// Metadata as it appears on the client-facing wire (binary values base64).
pub type ClientMetadata = Metadata<String>;

/// Metadata as attached to or read from a backend call (binary values raw).
pub type BackendMetadata = Metadata<MetadataValue>;

impl<V> Default for Metadata<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> Metadata<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping any existing values for the same key.
    pub fn append(&mut self, key: impl AsRef<str>, value: V) {
        self.entries.push((key.as_ref().to_ascii_lowercase(), value));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a V> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V> FromIterator<(K, V)> for Metadata<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.append(key, value);
        }
        metadata
    }
}

impl ClientMetadata {
    /// Collect request headers. Values that are not visible ASCII are skipped.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut metadata = Metadata::new();
        for (name, value) in headers.iter() {
            match value.to_str() {
                Ok(text) => metadata.append(name.as_str(), text.to_string()),
                Err(_) => tracing::debug!(key = %name, "skipping non-ASCII header value"),
            }
        }
        metadata
    }

    /// Append every entry to an outgoing header map.
    pub fn extend_header_map(&self, headers: &mut HeaderMap) {
        for (key, value) in self.iter() {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::warn!(key, "dropping header that is not valid on the wire"),
            }
        }
    }
}

impl BackendMetadata {
    /// Collect response headers or trailers from a backend. `-bin` values are
    /// decoded; undecodable ones are skipped.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut metadata = Metadata::new();
        for (name, value) in headers.iter() {
            let key = name.as_str();
            if is_binary_key(key) {
                match LENIENT_BASE64.decode(value.as_bytes()) {
                    Ok(bytes) => metadata.append(key, MetadataValue::Binary(Bytes::from(bytes))),
                    Err(err) => tracing::warn!(key, error = %err, "skipping undecodable binary header"),
                }
            } else if let Ok(text) = value.to_str() {
                metadata.append(key, MetadataValue::Text(text.to_string()));
            }
        }
        metadata
    }

    /// Append every entry to an outgoing header map, base64-encoding binary values.
    pub fn extend_header_map(&self, headers: &mut HeaderMap) {
        for (key, value) in self.iter() {
            let encoded = match value {
                MetadataValue::Text(text) => HeaderValue::from_str(text),
                MetadataValue::Binary(bytes) => HeaderValue::from_str(&STANDARD_NO_PAD.encode(bytes)),
            };
            match (HeaderName::from_bytes(key.as_bytes()), encoded) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::warn!(key, "dropping metadata that is not valid on the wire"),
            }
        }
    }
}

pub fn is_binary_key(key: &str) -> bool {
    key.ends_with(BINARY_SUFFIX)
}

/// Whether a key belongs to the transport rather than the application.
pub fn is_transport_managed(key: &str) -> bool {
    key.starts_with(':') || TRANSPORT_MANAGED.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Translate client request headers into metadata for the backend call.
pub fn downstream_to_upstream(headers: &ClientMetadata) -> BackendMetadata {
    let mut out = BackendMetadata::new();
    for (key, value) in headers.iter() {
        if is_transport_managed(key) {
            continue;
        }
        if !is_binary_key(key) {
            out.append(key, MetadataValue::Text(value.clone()));
            continue;
        }
        match LENIENT_BASE64.decode(value.trim()) {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => out.append(key, MetadataValue::Binary(Bytes::from(bytes))),
            Err(err) => tracing::warn!(key, error = %err, "dropping binary header with invalid base64"),
        }
    }
    out
}

/// Translate backend initial metadata or trailers into client-facing headers.
pub fn upstream_to_downstream(metadata: &BackendMetadata) -> ClientMetadata {
    let mut out = ClientMetadata::new();
    for (key, value) in metadata.iter() {
        if is_transport_managed(key) {
            continue;
        }
        let relayed = match value {
            MetadataValue::Binary(bytes) if bytes.is_empty() => continue,
            MetadataValue::Binary(bytes) => STANDARD_NO_PAD.encode(bytes),
            MetadataValue::Text(text) if is_binary_key(key) => {
                if text.is_empty() {
                    continue;
                }
                STANDARD_NO_PAD.encode(text.as_bytes())
            }
            MetadataValue::Text(text) => text.clone(),
        };
        out.append(key, relayed);
    }
    out
}

//! Binary transport envelope
//!
//! Every message that leaves a process (push notifications to the API
//! layer, detector job hand-off) is wrapped in an [`Envelope`]: a type tag,
//! an opaque payload, a timestamp and free-form string headers. Envelopes are
//! encoded with `postcard`, which keeps them compact and schema-stable.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the payload content type
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Content type used by [`Envelope::json`]
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag (e.g. `process_frame_pair`, `DetectorStateChanged`)
    pub message_type: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Free-form headers (correlation id, content type, origin, ...)
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Create an envelope around raw payload bytes
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp_ms: crate::time::unix_millis(),
            headers: BTreeMap::new(),
        }
    }

    /// Create an envelope whose payload is the JSON encoding of `value`
    pub fn json<T: Serialize>(message_type: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(message_type, payload).with_header(CONTENT_TYPE_HEADER, CONTENT_TYPE_JSON))
    }

    /// Add or replace a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Decode a JSON payload into `T`
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        if let Some(content_type) = self.header(CONTENT_TYPE_HEADER) {
            if content_type != CONTENT_TYPE_JSON {
                return Err(Error::Serialization(format!(
                    "Envelope '{}' carries {}, not JSON",
                    self.message_type, content_type
                )));
            }
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode to the compact binary wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Decode from the compact binary wire form
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

//! Wire codec for connection sets
//!
//! The envelope is `{"connections": [...]}`. An empty set is written as
//! either `null` or `[]` depending on [`EncodeOptions`]; decoding accepts
//! both, as well as a missing key.

use crate::connection::{ConnectionRecord, Connections, IPTranslation};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode connections: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode connections: {0}")]
    Decode(#[source] serde_json::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encoding options
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Write an empty set as `[]` instead of `null`
    pub nil_slice_as_empty: bool,

    /// Pretty print JSON
    pub pretty: bool,
}

#[derive(Serialize)]
struct Envelope<'a> {
    connections: Option<&'a [ConnectionRecord]>,
}

/// Serialize a connection set
pub fn encode(conns: &Connections, options: &EncodeOptions) -> CodecResult<Vec<u8>> {
    let envelope = Envelope {
        connections: if conns.conns.is_empty() && !options.nil_slice_as_empty {
            None
        } else {
            Some(conns.conns.as_slice())
        },
    };

    if options.pretty {
        serde_json::to_vec_pretty(&envelope).map_err(CodecError::Encode)
    } else {
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }
}

/// Deserialize a connection set
///
/// Either the whole payload decodes or an error is returned; no partial
/// list is ever produced.
pub fn decode(data: &[u8]) -> CodecResult<Connections> {
    serde_json::from_slice(data).map_err(CodecError::Decode)
}

/// Deserialize a sequence of concatenated or newline-separated payloads
pub fn decode_stream(data: &[u8]) -> CodecResult<Vec<Connections>> {
    serde_json::Deserializer::from_slice(data)
        .into_iter::<Connections>()
        .collect::<Result<_, _>>()
        .map_err(CodecError::Decode)
}

/// `null` and a missing key both mean "no connections"
pub(crate) fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ConnectionRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ConnectionRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A malformed conntrack object degrades to "no translation" instead of
/// failing the whole payload.
pub(crate) fn lenient_translation<'de, D>(
    deserializer: D,
) -> Result<Option<IPTranslation>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match serde_json::from_value(v) {
        Ok(translation) => Some(translation),
        Err(e) => {
            debug!("Dropping malformed conntrack object: {}", e);
            None
        }
    }))
}

//! Value Codec
//!
//! Turns cache values into the opaque bytes written to files, shared memory
//! segments and remote servers, and back.

use serde_json::Value;

use crate::error::Result;

/// Serializes a value into bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserializes bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decodes bytes that may have been written by a foreign client.
///
/// Anything that is not valid JSON comes back as a plain string.
pub fn decode_lenient(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

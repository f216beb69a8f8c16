//! # JSON Serialization Module
//!
//! JSON parsing using simd-json with serde_json fallback.
//! Used for request bodies and `json` attribute casts.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Parse JSON string to a typed value using simd-json
///
/// Falls back to serde_json when simd-json rejects the input, so the error
/// reported to callers is always a `serde_json::Error`.
///
/// # Errors
///
/// Returns `Error::Json` if parsing fails
pub fn parse_json<T: DeserializeOwned>(json_str: &str) -> Result<T> {
    let mut bytes = json_str.as_bytes().to_vec();
    parse_json_bytes(&mut bytes)
}

/// Parse JSON bytes to a typed value using simd-json
///
/// simd-json parses in place, so the buffer contents are unspecified
/// afterwards.
///
/// # Errors
///
/// Returns `Error::Json` if parsing fails
pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &mut [u8]) -> Result<T> {
    let pristine = bytes.to_vec();
    match simd_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(_) => Ok(serde_json::from_slice(&pristine)?),
    }
}

/// Serialize a value to JSON string
///
/// # Errors
///
/// Returns `Error::Json` if serialization fails
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Serialize a value to pretty-printed JSON string
///
/// # Errors
///
/// Returns `Error::Json` if serialization fails
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

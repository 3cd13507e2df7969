//! Codec
//!
//! Byte-level transforms used by access-key decoding. Everything here is a
//! pure function without state.

use std::collections::HashMap;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::error::{OutlineError, Result};

/// Standard alphabet, padding optional on decode, always emitted on encode.
const PERMISSIVE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decode standard-alphabet base64, ignoring ASCII whitespace and missing
/// or present padding.
pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(PERMISSIVE.decode(compact.as_bytes())?)
}

/// Encode bytes as padded standard-alphabet base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    PERMISSIVE.encode(bytes)
}

/// Interpret bytes as UTF-8 text.
pub fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| OutlineError::MalformedEncoding(format!("invalid UTF-8: {}", e)))
}

/// Percent-decode a URI component into UTF-8 text.
pub fn percent_decode(s: &str) -> Result<String> {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| OutlineError::MalformedEncoding(format!("invalid percent-encoding: {}", e)))
}

/// Parse a `k=v&k2=v2` query string. Values are percent-decoded, keys are
/// taken verbatim, a key without `=` maps to an empty value, and a later
/// duplicate key replaces an earlier one.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(raw_value).unwrap_or_else(|_| {
            String::from_utf8_lossy(&urlencoding::decode_binary(raw_value.as_bytes())).into_owned()
        });
        params.insert(key.to_string(), value);
    }
    params
}

/// Convert prefix text into raw bytes.
///
/// Each code point in U+0000..=U+00FF stands for one byte. Text with any
/// higher code point is taken as its UTF-8 encoding instead. This differs
/// from a plain UTF-8 conversion: `%C2%A8` yields the single byte 0xA8.
pub fn text_to_bytes(text: &str) -> Vec<u8> {
    if text.chars().all(|c| (c as u32) <= 0xFF) {
        text.chars().map(|c| c as u32 as u8).collect()
    } else {
        text.as_bytes().to_vec()
    }
}

/// Inverse of [`text_to_bytes`] for the single-byte mapping.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

//! Access-key validator
//!
//! Structural acceptance check for live-typing feedback. Shares the grammar
//! of the parser but never touches the network and does not look inside the
//! decoded credentials. The parser stays the authoritative check before a
//! session is started.

use crate::codec;
use crate::parser::{
    credential_payload, is_partially_encoded, split_fragment, DIRECT_SCHEME, INDIRECTION_SCHEME,
    PARTIAL_ENCODING,
};

/// Outcome of [`check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    fn accepted() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// `true` if the key is structurally acceptable.
pub fn validate(uri: &str) -> bool {
    check(uri).valid
}

/// Like [`validate`], with the reason for a rejection.
pub fn check(uri: &str) -> ValidationResult {
    let uri = uri.trim();

    if uri.starts_with(INDIRECTION_SCHEME) {
        return ValidationResult::accepted();
    }

    let Some(remainder) = uri.strip_prefix(DIRECT_SCHEME) else {
        return ValidationResult::rejected("unrecognized scheme");
    };

    if is_partially_encoded(remainder) {
        let Some(caps) = PARTIAL_ENCODING.captures(uri) else {
            return ValidationResult::rejected("invalid link format");
        };
        match credential_payload(&caps) {
            Ok(bytes) if !bytes.is_empty() => ValidationResult::accepted(),
            Ok(_) => ValidationResult::rejected("empty credentials"),
            Err(e) => ValidationResult::rejected(e.to_string()),
        }
    } else {
        let (encoded, _) = split_fragment(remainder);
        match codec::decode_base64(encoded) {
            Ok(bytes) if !bytes.is_empty() => ValidationResult::accepted(),
            Ok(_) => ValidationResult::rejected("empty access key"),
            Err(e) => ValidationResult::rejected(e.to_string()),
        }
    }
}

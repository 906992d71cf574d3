// JWT expiry extraction
// Reads the `exp` claim without verifying the signature

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde_json::Value;

use crate::error::TokenError;

const RELAXED: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);

/// Standard alphabet, padding optional
const STANDARD_RELAXED: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, RELAXED);

/// URL-safe alphabet (what JWTs normally use), padding optional
const URL_SAFE_RELAXED: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, RELAXED);

/// Extract the absolute `exp` (Unix seconds) from a `header.payload.signature` token
pub fn token_expiration(token: &str) -> Result<i64, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::Decode(format!(
            "expected 3 dot-separated JWT segments, found {}",
            segments.len()
        )));
    }

    let payload = decode_segment(segments[1])?;

    let claims: Value = serde_json::from_slice(&payload)
        .map_err(|e| TokenError::Decode(format!("JWT payload is not JSON: {}", e)))?;

    claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| TokenError::Decode("JWT payload has no integer exp claim".to_string()))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, TokenError> {
    STANDARD_RELAXED
        .decode(segment)
        .or_else(|_| URL_SAFE_RELAXED.decode(segment))
        .map_err(|e| TokenError::Decode(format!("JWT payload is not base64: {}", e)))
}

//! 0-RTT early data carried in `Sec-WebSocket-Protocol`
//!
//! Clients put the first bytes they would send after the handshake into the
//! subprotocol header, base64url encoded without padding.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;

/// Standard alphabet that tolerates missing or present padding
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Early data token failed to decode
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("early data is not valid base64url: {0}")]
pub struct EarlyDataError(pub String);

/// Decode an early-data token. An empty or absent token yields `None`.
pub fn decode_early_data(token: Option<&str>) -> Result<Option<Vec<u8>>, EarlyDataError> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(None),
    };

    let normalized = token.replace('-', "+").replace('_', "/");
    LENIENT_STANDARD
        .decode(normalized.as_bytes())
        .map(Some)
        .map_err(|e| EarlyDataError(e.to_string()))
}

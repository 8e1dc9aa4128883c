//! VLESS user identity
//!
//! A 16-byte identifier carried raw on the wire and rendered in the canonical
//! `8-4-4-4-12` lower-case hex form for configuration and logs.

use rand::RngCore;
use std::fmt;
use std::str::FromStr;

/// Raw identity length on the wire
pub const IDENTITY_LEN: usize = 16;

/// Rendered identity length (32 hex digits + 4 hyphens)
const RENDERED_LEN: usize = 36;

/// Hyphen positions in the rendered form
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// Identity parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity must be 36 characters, got {0}")]
    InvalidLength(usize),

    #[error("identity is not in 8-4-4-4-12 hex form: {0}")]
    InvalidFormat(String),
}

/// 16-byte user identity
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId([u8; IDENTITY_LEN]);

impl UserId {
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Generate a random version 4 identity
    pub fn random() -> Self {
        let mut bytes = [0u8; IDENTITY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }

    /// Parse a rendered identity. Upper-case hex is accepted on input.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.len() != RENDERED_LEN {
            return Err(IdentityError::InvalidLength(s.len()));
        }
        let lowered = s.to_ascii_lowercase();
        if !is_canonical(&lowered) {
            return Err(IdentityError::InvalidFormat(s.to_string()));
        }

        let digits: String = lowered.chars().filter(|c| *c != '-').collect();
        let mut bytes = [0u8; IDENTITY_LEN];
        hex::decode_to_slice(&digits, &mut bytes)
            .map_err(|_| IdentityError::InvalidFormat(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Render as lower-case `8-4-4-4-12`
    pub fn render(&self) -> String {
        let h = hex::encode(self.0);
        format!(
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }

    /// Check a candidate identity taken off the wire.
    ///
    /// Bytes must match exactly; the rendered candidate must also satisfy the
    /// canonical grammar.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if candidate != self.0.as_slice() {
            return false;
        }
        let mut raw = [0u8; IDENTITY_LEN];
        raw.copy_from_slice(candidate);
        is_canonical(&UserId(raw).render())
    }
}

/// `true` when `s` is a lower-case `8-4-4-4-12` hex identity string
pub fn is_canonical(s: &str) -> bool {
    if s.len() != RENDERED_LEN {
        return false;
    }
    s.bytes().enumerate().all(|(i, b)| {
        if HYPHENS.contains(&i) {
            b == b'-'
        } else {
            matches!(b, b'0'..=b'9' | b'a'..=b'f')
        }
    })
}

impl FromStr for UserId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.render())
    }
}

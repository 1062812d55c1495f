//! Access and skew-protection tokens.

use std::fmt;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::mode::SessionMode;

/// Token a client must present to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// A fresh random token.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Use an externally configured token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Whether `candidate` matches this token.
    #[must_use]
    pub fn verify(&self, candidate: &str) -> bool {
        self.0.len() == candidate.len()
            && self
                .0
                .bytes()
                .zip(candidate.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    /// Token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(****)")
    }
}

/// Token that ties a client bundle to the server instance it was served by.
///
/// Random in edit mode. In run mode it is derived from the notebook source
/// so that every replica serving the same notebook agrees on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkewProtectionToken(String);

impl SkewProtectionToken {
    /// Token for a server in `mode`; `code` is the notebook source, if any.
    #[must_use]
    pub fn for_mode(mode: SessionMode, code: Option<&str>) -> Self {
        match (mode, code) {
            (SessionMode::Run, Some(code)) => {
                let mut hasher = Sha256::new();
                hasher.update(code.as_bytes());
                Self(format!("{:x}", hasher.finalize()))
            }
            _ => Self(Uuid::new_v4().simple().to_string()),
        }
    }

    /// Token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

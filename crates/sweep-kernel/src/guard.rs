//! Admission control for inbound change events.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// The only verb the trigger transport uses.
pub const ACCEPTED_METHOD: &str = "POST";

/// Header carrying the shared secret unless configured otherwise.
pub const DEFAULT_SECRET_HEADER: &str = "x-webhook-secret";

/// Reasons a request never reaches the reconciler.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("shared secret is not configured")]
    MisconfiguredServer,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Method not allowed")]
    MethodNotAllowed,
}

/// Shared-secret gate in front of the reconciler.
///
/// Identity is checked before the method so unauthenticated callers cannot
/// learn which verbs are accepted.
#[derive(Clone)]
pub struct AccessGuard {
    secret_digest: Option<[u8; 32]>,
}

impl AccessGuard {
    /// A blank secret leaves the guard unconfigured, which rejects everything.
    pub fn new(secret: Option<&str>) -> Self {
        let secret_digest = secret
            .filter(|value| !value.trim().is_empty())
            .map(digest);
        Self { secret_digest }
    }

    pub fn is_configured(&self) -> bool {
        self.secret_digest.is_some()
    }

    /// Full admission check for the trigger endpoint.
    pub fn check(&self, method: &str, credential: Option<&str>) -> Result<(), Rejection> {
        self.authenticate(credential)?;

        if method != ACCEPTED_METHOD {
            warn!(method, "rejecting request: method not allowed");
            return Err(Rejection::MethodNotAllowed);
        }

        Ok(())
    }

    /// Credential check only, for read endpoints that accept other verbs.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<(), Rejection> {
        let Some(expected) = self.secret_digest.as_ref() else {
            warn!("rejecting request: shared secret is not configured");
            return Err(Rejection::MisconfiguredServer);
        };

        // Digests have a fixed length, so the comparison cost does not depend
        // on how much of the secret a caller guessed.
        if credential.map(digest).as_ref() != Some(expected) {
            warn!(
                credential_present = credential.is_some(),
                "rejecting request: credential mismatch"
            );
            return Err(Rejection::Unauthorized);
        }

        Ok(())
    }
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

//! # Cryptographic Infrastructure
//!
//! This module provides the keyed primitives behind the trust channels:
//!
//! - **Session Keys**: BLAKE3 `derive_key` over both endpoints' secrets and
//!   the ordered pair of identities
//! - **Message Authentication**: domain-separated BLAKE3 keyed hashes
//!
//! ## Key Model
//!
//! Session keys are **directional**. The key for `A -> B` binds the ordered
//! pair as context, so it differs from the key for `B -> A`. A compromised
//! channel in one direction does not authenticate traffic in the other.
//!
//! ## Security Properties
//!
//! - Derivation is keyed by both secrets; knowing the identities alone is not
//!   enough to guess a key
//! - Every derivation input is length-prefixed, so distinct inputs never
//!   concatenate to the same byte string
//! - MAC verification compares `blake3::Hash` values, whose equality is
//!   constant time
//! - Domain separation prevents a MAC from one message type being accepted
//!   as another

use std::fmt;

use subtle::ConstantTimeEq;

use crate::auth::TrustedPeerSet;
use crate::identity::{ControllerId, KeyDirectory, SharedSecret};

// ============================================================================
// Domain Separation
// ============================================================================

/// BLAKE3 KDF context for trust channel session keys.
pub const SESSION_KEY_CONTEXT: &str = "stam 2024 trust-channel session key v1";

/// Domain separation prefix for policy envelope MACs.
pub const ENVELOPE_MAC_DOMAIN: &[u8] = b"stam-envelope-v1:";

/// Length of a session key and of every MAC tag, in bytes.
pub const KEY_LEN: usize = 32;

// ============================================================================
// Error Types
// ============================================================================

/// Error type for MAC verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacError {
    /// Tag is missing (empty).
    Missing,
    /// Tag has invalid length (expected 32 bytes).
    InvalidLength,
    /// Tag does not match the data under this key.
    VerificationFailed,
}

impl fmt::Display for MacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacError::Missing => write!(f, "message authentication tag is missing"),
            MacError::InvalidLength => write!(f, "message authentication tag has invalid length"),
            MacError::VerificationFailed => write!(f, "message authentication failed"),
        }
    }
}

impl std::error::Error for MacError {}

/// Error type for session key derivation requests outside the trusted pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    /// Source and destination are the same controller.
    SameEndpoint(ControllerId),
    /// One endpoint never authenticated.
    Untrusted(ControllerId),
    /// One endpoint has no Key Directory entry.
    MissingSecret(ControllerId),
}

impl fmt::Display for DeriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeriveError::SameEndpoint(id) => {
                write!(f, "cannot derive a session key from {id} to itself")
            }
            DeriveError::Untrusted(id) => write!(f, "controller {id} is not trusted"),
            DeriveError::MissingSecret(id) => {
                write!(f, "controller {id} has no key directory entry")
            }
        }
    }
}

impl std::error::Error for DeriveError {}

// ============================================================================
// Session Keys
// ============================================================================

#[derive(Clone, Copy)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short public fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..4])
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Derive the directional session key for `source -> destination`.
///
/// Deterministic for fixed inputs, and not invertible to either secret.
pub fn derive_session_key(
    source: &ControllerId,
    source_secret: &SharedSecret,
    destination: &ControllerId,
    destination_secret: &SharedSecret,
) -> SessionKey {
    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KEY_CONTEXT);
    for part in [
        source_secret.as_bytes(),
        destination_secret.as_bytes(),
        source.as_bytes(),
        destination.as_bytes(),
    ] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    SessionKey(*hasher.finalize().as_bytes())
}

/// Session key derivation restricted to pairs of distinct trusted peers.
pub struct SessionKeyDeriver<'a> {
    directory: &'a KeyDirectory,
    trusted: &'a TrustedPeerSet,
}

impl<'a> SessionKeyDeriver<'a> {
    pub fn new(directory: &'a KeyDirectory, trusted: &'a TrustedPeerSet) -> Self {
        Self { directory, trusted }
    }

    pub fn derive(
        &self,
        source: &ControllerId,
        destination: &ControllerId,
    ) -> Result<SessionKey, DeriveError> {
        if source == destination {
            return Err(DeriveError::SameEndpoint(source.clone()));
        }
        for endpoint in [source, destination] {
            if !self.trusted.contains(endpoint) {
                return Err(DeriveError::Untrusted(endpoint.clone()));
            }
        }
        let source_secret = self
            .directory
            .get(source)
            .ok_or_else(|| DeriveError::MissingSecret(source.clone()))?;
        let destination_secret = self
            .directory
            .get(destination)
            .ok_or_else(|| DeriveError::MissingSecret(destination.clone()))?;

        Ok(derive_session_key(
            source,
            source_secret,
            destination,
            destination_secret,
        ))
    }
}

// ============================================================================
// Domain-Separated MAC Helpers
// ============================================================================

/// Compute a MAC over `data` with domain separation.
pub fn mac_with_domain(key: &SessionKey, domain: &[u8], data: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
    hasher.update(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Verify a MAC produced by [`mac_with_domain`].
pub fn verify_mac_with_domain(
    key: &SessionKey,
    domain: &[u8],
    data: &[u8],
    tag: &[u8],
) -> Result<(), MacError> {
    if tag.is_empty() {
        return Err(MacError::Missing);
    }
    let tag: [u8; KEY_LEN] = tag.try_into().map_err(|_| MacError::InvalidLength)?;

    let expected = blake3::Hash::from(mac_with_domain(key, domain, data));
    if expected == blake3::Hash::from(tag) {
        Ok(())
    } else {
        Err(MacError::VerificationFailed)
    }
}

//! # Controller Identities and the Key Directory
//!
//! This module defines the identity types shared by every other component:
//!
//! - [`ControllerId`]: opaque, non-empty token naming one SDN controller
//! - [`SharedSecret`]: pre-shared secret bytes owned by a single controller
//! - [`KeyDirectory`]: static mapping of controller identity to its secret
//!
//! ## Secret Handling
//!
//! Secrets never leave this process in cleartext. `SharedSecret` redacts itself
//! in `Debug` output and only exposes its bytes inside the crate, where they
//! feed the constant-time proof check (`auth`) and the session key KDF
//! (`crypto`).
//!
//! ## Snapshots
//!
//! A `KeyDirectory` is never mutated once published. Rotation goes through
//! [`KeyDirectory::with_secret`], which returns a new directory and leaves the
//! old one untouched for readers still holding it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of a controller identity token in bytes.
pub const MAX_CONTROLLER_ID_LENGTH: usize = 128;

/// Domain separation prefix for secret digests used in proof comparison.
const SECRET_DIGEST_DOMAIN: &str = "stam 2024 shared-secret digest v1";

#[inline]
fn has_valid_characters(id: &str) -> bool {
    id.chars().all(|c| c.is_ascii_graphic())
}

/// Error returned when constructing an identity or secret from invalid input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    /// Identity token is empty.
    Empty,
    /// Identity token exceeds [`MAX_CONTROLLER_ID_LENGTH`].
    TooLong,
    /// Identity token contains whitespace or non-ASCII characters.
    InvalidCharacters,
    /// Shared secret has no bytes.
    EmptySecret,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Empty => write!(f, "controller identity is empty"),
            IdentityError::TooLong => write!(f, "controller identity exceeds maximum length"),
            IdentityError::InvalidCharacters => {
                write!(f, "controller identity must be printable ASCII without whitespace")
            }
            IdentityError::EmptySecret => write!(f, "shared secret is empty"),
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ControllerId(String);

impl ControllerId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        if id.len() > MAX_CONTROLLER_ID_LENGTH {
            return Err(IdentityError::TooLong);
        }
        if !has_valid_characters(&id) {
            return Err(IdentityError::InvalidCharacters);
        }
        Ok(Self(id))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControllerId({})", self.0)
    }
}

impl TryFrom<String> for ControllerId {
    type Error = IdentityError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<ControllerId> for String {
    fn from(id: ControllerId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ControllerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Pre-shared secret of a single controller.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, IdentityError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(IdentityError::EmptySecret);
        }
        Ok(Self(bytes))
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Fixed-length digest of the secret.
    ///
    /// Proofs are compared digest-to-digest so the comparison takes the same
    /// time regardless of the secret's length.
    pub(crate) fn digest(&self) -> [u8; 32] {
        digest_proof(&self.0)
    }

    /// Short public fingerprint for log lines. Not usable as key material.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.digest());
        hex::encode(&digest.as_bytes()[..4])
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

pub(crate) fn digest_proof(proof: &[u8]) -> [u8; 32] {
    blake3::derive_key(SECRET_DIGEST_DOMAIN, proof)
}

/// Static mapping of controller identity to pre-shared secret.
#[derive(Clone, Debug, Default)]
pub struct KeyDirectory {
    entries: BTreeMap<ControllerId, SharedSecret>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller. Returns the previous secret if the identity was
    /// already present.
    pub fn insert(&mut self, id: ControllerId, secret: SharedSecret) -> Option<SharedSecret> {
        self.entries.insert(id, secret)
    }

    /// Return a new directory with `id` bound to `secret`, leaving `self`
    /// unchanged.
    pub fn with_secret(&self, id: ControllerId, secret: SharedSecret) -> Self {
        let mut next = self.clone();
        next.entries.insert(id, secret);
        next
    }

    pub fn get(&self, id: &ControllerId) -> Option<&SharedSecret> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ControllerId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &ControllerId> {
        self.entries.keys()
    }
}

impl FromIterator<(ControllerId, SharedSecret)> for KeyDirectory {
    fn from_iter<I: IntoIterator<Item = (ControllerId, SharedSecret)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

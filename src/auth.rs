//! # Controller Authentication
//!
//! The trust boundary of the coordination layer. A controller joins the
//! [`TrustedPeerSet`] by presenting a proof that matches its entry in the
//! [`KeyDirectory`].
//!
//! ## Security Properties
//!
//! - Proofs are compared in constant time (`subtle::ConstantTimeEq`) over
//!   fixed-length digests, so neither the content nor the length of a secret
//!   leaks through timing.
//! - Unknown identities take the same comparison path against a dummy digest.
//! - Failure is an expected outcome and is reported as `false`, never as an
//!   error.
//! - The trusted set only grows, and only during the authentication phase.

use std::collections::BTreeSet;

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::identity::{digest_proof, ControllerId, KeyDirectory};

/// Set of controllers whose authentication succeeded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustedPeerSet {
    peers: BTreeSet<ControllerId>,
}

impl TrustedPeerSet {
    pub fn contains(&self, id: &ControllerId) -> bool {
        self.peers.contains(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControllerId> {
        self.peers.iter()
    }

    /// Returns `true` if the peer was newly added.
    fn admit(&mut self, id: ControllerId) -> bool {
        self.peers.insert(id)
    }
}

impl FromIterator<ControllerId> for TrustedPeerSet {
    fn from_iter<I: IntoIterator<Item = ControllerId>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a TrustedPeerSet {
    type Item = &'a ControllerId;
    type IntoIter = std::collections::btree_set::Iter<'a, ControllerId>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

pub struct Authenticator {
    directory: KeyDirectory,
    trusted: TrustedPeerSet,
}

impl Authenticator {
    pub fn new(directory: KeyDirectory) -> Self {
        Self {
            directory,
            trusted: TrustedPeerSet::default(),
        }
    }

    /// Validate `identity` against the Key Directory using `proof`.
    ///
    /// On success the identity is admitted to the trusted set (idempotent).
    pub fn authenticate(&mut self, identity: &str, proof: &[u8]) -> bool {
        let Ok(id) = ControllerId::new(identity) else {
            debug!(identity = identity, "rejecting malformed controller identity");
            return false;
        };

        let presented = digest_proof(proof);
        let (expected, known) = match self.directory.get(&id) {
            Some(secret) => (secret.digest(), true),
            None => (digest_proof(b""), false),
        };

        let matches: bool = presented.ct_eq(&expected).into();
        if !(known && matches) {
            return false;
        }

        if self.trusted.admit(id.clone()) {
            debug!(controller = %id, "controller admitted to trusted set");
        }
        true
    }

    /// Authenticate a batch of `(identity, proof)` claims. Failures are logged
    /// and the controller is left out of the trusted set.
    pub fn authenticate_all<'a, I>(&mut self, claims: I) -> &TrustedPeerSet
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        for (identity, proof) in claims {
            if self.authenticate(identity, proof) {
                info!(controller = identity, "authenticated");
            } else {
                warn!(controller = identity, "authentication failed");
            }
        }
        &self.trusted
    }

    pub fn trusted(&self) -> &TrustedPeerSet {
        &self.trusted
    }

    pub fn directory(&self) -> &KeyDirectory {
        &self.directory
    }

    /// End the authentication phase, handing back the directory and the
    /// final trusted set.
    pub fn finish(self) -> (KeyDirectory, TrustedPeerSet) {
        (self.directory, self.trusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SharedSecret;

    fn directory() -> KeyDirectory {
        [("ctrlA", "alpha_secret"), ("ctrlB", "beta_secret")]
            .into_iter()
            .map(|(id, secret)| {
                (
                    ControllerId::new(id).unwrap(),
                    SharedSecret::new(secret.as_bytes().to_vec()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn known_identity_with_matching_proof_is_admitted() {
        let mut auth = Authenticator::new(directory());
        assert!(auth.authenticate("ctrlA", &b"alpha_secret"[..]));
        assert!(auth.trusted().contains(&ControllerId::new("ctrlA").unwrap()));
        assert_eq!(auth.trusted().len(), 1);
    }

    #[test]
    fn unknown_identity_or_bad_proof_is_rejected_without_side_effects() {
        let mut auth = Authenticator::new(directory());
        let claims: [(&str, &[u8]); 6] = [
            ("ctrlC", &b"alpha_secret"[..]),
            ("ctrlA", &b"beta_secret"[..]),
            ("ctrlA", &b"alpha_secre"[..]),
            ("ctrlA", &b"alpha_secret\0"[..]),
            ("ctrlA", &b""[..]),
            ("", &b"alpha_secret"[..]),
        ];
        for (identity, proof) in claims {
            assert!(!auth.authenticate(identity, proof), "{identity:?} should fail");
        }
        assert!(auth.trusted().is_empty());
    }

    #[test]
    fn authentication_is_idempotent() {
        let mut auth = Authenticator::new(directory());
        assert!(auth.authenticate("ctrlB", &b"beta_secret"[..]));
        assert!(auth.authenticate("ctrlB", &b"beta_secret"[..]));
        assert_eq!(auth.trusted().len(), 1);
    }

    #[test]
    fn batch_authentication_excludes_failures() {
        let mut auth = Authenticator::new(directory());
        let claims: Vec<(&str, &[u8])> = vec![
            ("ctrlA", &b"alpha_secret"[..]),
            ("ctrlB", &b"wrong"[..]),
            ("ctrlZ", &b"zeta_secret"[..]),
        ];
        let trusted = auth.authenticate_all(claims);

        let ids: Vec<_> = trusted.iter().map(|c| c.as_str()).collect();
        assert_eq!(ids, vec!["ctrlA"]);

        let (directory, trusted) = auth.finish();
        assert_eq!(directory.len(), 2);
        assert_eq!(trusted.len(), 1);
    }
}

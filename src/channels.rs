//! # Trust Channel Table
//!
//! Maps every ordered pair of distinct trusted controllers to its directional
//! [`SessionKey`].
//!
//! ## Snapshot Publication
//!
//! The table is process-wide, read-mostly state. [`TrustChannels`] owns the
//! current snapshot behind an `Arc`:
//!
//! | Operation | Who | Effect |
//! |-----------|-----|--------|
//! | `snapshot()` | Broadcaster, listeners | Clone the current `Arc`, never blocks on rebuilds |
//! | `rotate_secret()` | Operator | Rebuild pairs touching one controller, publish |
//! | `revoke()` | Operator | Publish a table without any pair touching one controller |
//!
//! Writers are serialized and build the replacement table off to the side;
//! the only work done under the publish lock is swapping the `Arc`. A reader
//! therefore sees either the old table or the new one, never a mix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::auth::TrustedPeerSet;
use crate::crypto::{SessionKey, SessionKeyDeriver};
use crate::identity::{ControllerId, KeyDirectory, SharedSecret};

/// Directed channel between two controllers.
pub type ChannelPair = (ControllerId, ControllerId);

/// Lookup miss against the trust channel table: the pair was never trusted,
/// or one endpoint has been revoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNotFound {
    pub source: ControllerId,
    pub destination: ControllerId,
}

impl fmt::Display for KeyNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no trust channel from {} to {}",
            self.source, self.destination
        )
    }
}

impl std::error::Error for KeyNotFound {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustChannelTable {
    keys: BTreeMap<ChannelPair, SessionKey>,
}

impl TrustChannelTable {
    /// Populate a key for every ordered pair of distinct trusted peers.
    pub fn build(directory: &KeyDirectory, trusted: &TrustedPeerSet) -> Self {
        let deriver = SessionKeyDeriver::new(directory, trusted);
        let mut keys = BTreeMap::new();

        for source in trusted {
            for destination in trusted {
                if source == destination {
                    continue;
                }
                match deriver.derive(source, destination) {
                    Ok(key) => {
                        keys.insert((source.clone(), destination.clone()), key);
                    }
                    Err(e) => {
                        warn!(%source, %destination, error = %e, "skipping trust channel");
                    }
                }
            }
        }

        debug!(channels = keys.len(), peers = trusted.len(), "trust channel table built");
        Self { keys }
    }

    pub fn lookup(
        &self,
        source: &ControllerId,
        destination: &ControllerId,
    ) -> Result<SessionKey, KeyNotFound> {
        self.keys
            .get(&(source.clone(), destination.clone()))
            .copied()
            .ok_or_else(|| KeyNotFound {
                source: source.clone(),
                destination: destination.clone(),
            })
    }

    pub fn contains(&self, source: &ControllerId, destination: &ControllerId) -> bool {
        self.keys.contains_key(&(source.clone(), destination.clone()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &ChannelPair> {
        self.keys.keys()
    }

    /// Copy of this table without the `source -> destination` channel.
    pub fn without_pair(&self, source: &ControllerId, destination: &ControllerId) -> Self {
        let mut keys = self.keys.clone();
        keys.remove(&(source.clone(), destination.clone()));
        Self { keys }
    }

    /// Copy of this table without any channel touching `peer`.
    pub fn without_peer(&self, peer: &ControllerId) -> Self {
        let keys = self
            .keys
            .iter()
            .filter(|((source, destination), _)| source != peer && destination != peer)
            .map(|(pair, key)| (pair.clone(), *key))
            .collect();
        Self { keys }
    }
}

struct WriterState {
    directory: KeyDirectory,
    trusted: TrustedPeerSet,
}

/// Owner of the published trust channel snapshot.
pub struct TrustChannels {
    writer: Mutex<WriterState>,
    current: RwLock<Arc<TrustChannelTable>>,
}

impl TrustChannels {
    /// Build the initial table once authentication has completed.
    pub fn establish(directory: KeyDirectory, trusted: TrustedPeerSet) -> Self {
        let table = TrustChannelTable::build(&directory, &trusted);
        info!(channels = table.len(), "trust channels established");
        Self {
            writer: Mutex::new(WriterState { directory, trusted }),
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Wrap an already built table. Used when the table comes from elsewhere
    /// (tests, or a table with pairs already removed).
    pub fn from_table(
        directory: KeyDirectory,
        trusted: TrustedPeerSet,
        table: TrustChannelTable,
    ) -> Self {
        Self {
            writer: Mutex::new(WriterState { directory, trusted }),
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Current consistent snapshot.
    pub fn snapshot(&self) -> Arc<TrustChannelTable> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn trusted(&self) -> TrustedPeerSet {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trusted
            .clone()
    }

    /// Replace the secret of `peer` and republish.
    ///
    /// Only the channels that have `peer` as an endpoint are rederived.
    /// Returns `false` when the secret is unchanged and nothing was published.
    pub fn rotate_secret(&self, peer: &ControllerId, secret: SharedSecret) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if writer.directory.get(peer) == Some(&secret) {
            return false;
        }

        let fingerprint = secret.fingerprint();
        writer.directory = writer.directory.with_secret(peer.clone(), secret);

        let current = self.snapshot();
        let deriver = SessionKeyDeriver::new(&writer.directory, &writer.trusted);
        let mut keys = current.keys.clone();
        for ((source, destination), key) in keys.iter_mut() {
            if source != peer && destination != peer {
                continue;
            }
            match deriver.derive(source, destination) {
                Ok(fresh) => *key = fresh,
                Err(e) => warn!(%source, %destination, error = %e, "rotation left stale key"),
            }
        }

        self.publish(TrustChannelTable { keys });
        info!(controller = %peer, fingerprint = %fingerprint, "secret rotated");
        true
    }

    /// Remove every channel touching `peer` and republish.
    pub fn revoke(&self, peer: &ControllerId) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.snapshot().without_peer(peer);
        self.publish(next);
        info!(controller = %peer, "trust channels revoked");
    }

    fn publish(&self, table: TrustChannelTable) {
        let next = Arc::new(table);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

//! # Peer Listener
//!
//! Receiving end of the trust channels. Every inbound [`Envelope`] passes
//! these checks in order before its [`PolicyUpdate`] is accepted:
//!
//! 1. Addressed to this controller
//! 2. A trust channel exists from the sender to us
//! 3. MAC verifies under that channel's session key
//! 4. Payload decodes within size bounds
//! 5. The update's issuer is the envelope's sender
//! 6. Sequence number is newer than the last one accepted from that sender
//!
//! ## Security Limits
//!
//! Replay state is kept per sender in a bounded LRU; a sender evicted from it
//! starts over from an empty window.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channels::{KeyNotFound, TrustChannels};
use crate::crypto::MacError;
use crate::identity::ControllerId;
use crate::messages::{deserialize_bounded, Envelope, PolicyUpdate};

/// Maximum senders to track sequence numbers for.
pub const MAX_TRACKED_SOURCES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Envelope is addressed to another controller.
    Misaddressed(ControllerId),
    /// No trust channel from the sender.
    NoChannel(KeyNotFound),
    /// MAC check failed.
    Mac(MacError),
    /// Payload is not a valid policy update.
    Decode(String),
    /// Update claims a different issuer than the channel it arrived on.
    IssuerMismatch {
        source: ControllerId,
        issuer: ControllerId,
    },
    /// Sequence number already seen from this sender.
    Replay {
        source: ControllerId,
        seqno: u64,
        last_accepted: u64,
    },
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaddressed(to) => write!(f, "envelope addressed to {to}"),
            Self::NoChannel(e) => write!(f, "{e}"),
            Self::Mac(e) => write!(f, "{e}"),
            Self::Decode(msg) => write!(f, "undecodable policy update: {msg}"),
            Self::IssuerMismatch { source, issuer } => {
                write!(f, "update from {source} claims issuer {issuer}")
            }
            Self::Replay {
                source,
                seqno,
                last_accepted,
            } => write!(
                f,
                "replayed update {seqno} from {source} (last accepted {last_accepted})"
            ),
        }
    }
}

impl std::error::Error for ListenerError {}

pub struct PeerListener {
    local: ControllerId,
    channels: Arc<TrustChannels>,
    last_seqno: LruCache<ControllerId, u64>,
}

impl PeerListener {
    pub fn new(local: ControllerId, channels: Arc<TrustChannels>) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_SOURCES)
            .expect("MAX_TRACKED_SOURCES must be non-zero");
        Self {
            local,
            channels,
            last_seqno: LruCache::new(cap),
        }
    }

    pub fn local(&self) -> &ControllerId {
        &self.local
    }

    pub fn accept(&mut self, envelope: &Envelope) -> Result<PolicyUpdate, ListenerError> {
        if envelope.destination != self.local {
            return Err(ListenerError::Misaddressed(envelope.destination.clone()));
        }

        let key = self
            .channels
            .snapshot()
            .lookup(&envelope.source, &self.local)
            .map_err(ListenerError::NoChannel)?;
        envelope.verify(&key).map_err(ListenerError::Mac)?;

        let update: PolicyUpdate = deserialize_bounded(&envelope.payload)
            .map_err(|e| ListenerError::Decode(e.to_string()))?;
        if update.issuer != envelope.source {
            return Err(ListenerError::IssuerMismatch {
                source: envelope.source.clone(),
                issuer: update.issuer,
            });
        }

        if let Some(&last_accepted) = self.last_seqno.get(&envelope.source) {
            if update.seqno <= last_accepted {
                return Err(ListenerError::Replay {
                    source: envelope.source.clone(),
                    seqno: update.seqno,
                    last_accepted,
                });
            }
        }
        self.last_seqno.put(envelope.source.clone(), update.seqno);

        Ok(update)
    }

    /// Accept envelopes from `inbox` until it closes. Returns the number of
    /// updates accepted.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>) -> u64 {
        let mut accepted = 0u64;
        while let Some(envelope) = inbox.recv().await {
            match self.accept(&envelope) {
                Ok(update) => {
                    accepted += 1;
                    info!(
                        controller = %self.local,
                        from = %update.issuer,
                        seqno = update.seqno,
                        actions = ?update.actions,
                        "policy update accepted"
                    );
                }
                Err(e) => {
                    warn!(controller = %self.local, from = %envelope.source, error = %e, "policy update rejected");
                }
            }
        }
        debug!(controller = %self.local, accepted, "listener inbox closed");
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::AdaptationReason;
    use crate::auth::TrustedPeerSet;
    use crate::identity::{KeyDirectory, SharedSecret};
    use crate::messages::serialize;
    use crate::metrics::MetricsSample;

    fn id(s: &str) -> ControllerId {
        ControllerId::new(s).unwrap()
    }

    fn channels() -> Arc<TrustChannels> {
        let directory: KeyDirectory = ["ctrlA", "ctrlB", "ctrlC"]
            .into_iter()
            .map(|c| (id(c), SharedSecret::new(format!("{c}_secret").into_bytes()).unwrap()))
            .collect();
        let trusted: TrustedPeerSet = directory.identities().cloned().collect();
        Arc::new(TrustChannels::establish(directory, trusted))
    }

    fn sealed(channels: &TrustChannels, from: &str, to: &str, seqno: u64) -> Envelope {
        let update = PolicyUpdate::for_adaptation(
            seqno,
            id(from),
            0,
            &[AdaptationReason::CongestionAlert],
            MetricsSample::new(0.6, 0.1, true).unwrap(),
        );
        let key = channels.snapshot().lookup(&id(from), &id(to)).unwrap();
        Envelope::seal(&key, id(from), id(to), serialize(&update).unwrap())
    }

    #[test]
    fn accepts_fresh_authenticated_update() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let update = listener.accept(&sealed(&channels, "ctrlA", "ctrlB", 1)).unwrap();
        assert_eq!(update.issuer, id("ctrlA"));
        assert_eq!(update.seqno, 1);
    }

    #[test]
    fn rejects_misaddressed_envelope() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let err = listener.accept(&sealed(&channels, "ctrlA", "ctrlC", 1)).unwrap_err();
        assert_eq!(err, ListenerError::Misaddressed(id("ctrlC")));
    }

    #[test]
    fn rejects_tampered_mac() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let mut envelope = sealed(&channels, "ctrlA", "ctrlB", 1);
        envelope.mac[0] ^= 0xFF;
        assert_eq!(
            listener.accept(&envelope),
            Err(ListenerError::Mac(MacError::VerificationFailed))
        );
    }

    #[test]
    fn rejects_envelope_sealed_with_reverse_channel_key() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let reverse_key = channels.snapshot().lookup(&id("ctrlB"), &id("ctrlA")).unwrap();
        let envelope = Envelope::seal(&reverse_key, id("ctrlA"), id("ctrlB"), b"x".to_vec());
        assert_eq!(
            listener.accept(&envelope),
            Err(ListenerError::Mac(MacError::VerificationFailed))
        );
    }

    #[test]
    fn rejects_replayed_sequence_numbers() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let first = sealed(&channels, "ctrlA", "ctrlB", 5);
        listener.accept(&first).unwrap();
        assert!(matches!(
            listener.accept(&first),
            Err(ListenerError::Replay { seqno: 5, last_accepted: 5, .. })
        ));
        assert!(matches!(
            listener.accept(&sealed(&channels, "ctrlA", "ctrlB", 4)),
            Err(ListenerError::Replay { .. })
        ));
        assert!(listener.accept(&sealed(&channels, "ctrlA", "ctrlB", 6)).is_ok());
        // Sequence numbers are tracked per sender.
        assert!(listener.accept(&sealed(&channels, "ctrlC", "ctrlB", 1)).is_ok());
    }

    #[test]
    fn rejects_after_revocation() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());
        let envelope = sealed(&channels, "ctrlA", "ctrlB", 1);

        channels.revoke(&id("ctrlA"));
        assert!(matches!(listener.accept(&envelope), Err(ListenerError::NoChannel(_))));
    }

    #[test]
    fn rejects_issuer_spoofing() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let spoofed = PolicyUpdate::for_adaptation(
            1,
            id("ctrlC"),
            0,
            &[],
            MetricsSample::new(0.1, 0.1, false).unwrap(),
        );
        let key = channels.snapshot().lookup(&id("ctrlA"), &id("ctrlB")).unwrap();
        let envelope = Envelope::seal(&key, id("ctrlA"), id("ctrlB"), serialize(&spoofed).unwrap());
        assert!(matches!(
            listener.accept(&envelope),
            Err(ListenerError::IssuerMismatch { .. })
        ));
    }

    #[test]
    fn rejects_garbage_payload() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let key = channels.snapshot().lookup(&id("ctrlA"), &id("ctrlB")).unwrap();
        let envelope = Envelope::seal(&key, id("ctrlA"), id("ctrlB"), vec![0xFF; 3]);
        assert!(matches!(listener.accept(&envelope), Err(ListenerError::Decode(_))));
    }

    #[test]
    fn rejects_update_carrying_invalid_sample() {
        let channels = channels();
        let mut listener = PeerListener::new(id("ctrlB"), channels.clone());

        let update = PolicyUpdate::for_adaptation(
            1,
            id("ctrlA"),
            0,
            &[AdaptationReason::LoadThreshold],
            MetricsSample::new(1.5, 0.1, false).unwrap(),
        );
        let mut payload = serialize(&update).unwrap();
        // seqno, issuer ("ctrlA"), issued_at_ms and one reason precede the
        // sample's traffic volume.
        let offset = 8 + (8 + 5) + 8 + (8 + 4);
        assert_eq!(&payload[offset..offset + 8], &1.5f64.to_le_bytes());
        payload[offset..offset + 8].copy_from_slice(&(-5.0f64).to_le_bytes());

        let key = channels.snapshot().lookup(&id("ctrlA"), &id("ctrlB")).unwrap();
        let envelope = Envelope::seal(&key, id("ctrlA"), id("ctrlB"), payload);
        assert!(matches!(listener.accept(&envelope), Err(ListenerError::Decode(_))));
    }

    #[tokio::test]
    async fn run_counts_accepted_updates() {
        let channels = channels();
        let listener = PeerListener::new(id("ctrlB"), channels.clone());
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(listener.run(rx));
        tx.send(sealed(&channels, "ctrlA", "ctrlB", 1)).await.unwrap();
        tx.send(sealed(&channels, "ctrlA", "ctrlB", 1)).await.unwrap();
        tx.send(sealed(&channels, "ctrlC", "ctrlB", 1)).await.unwrap();
        drop(tx);

        assert_eq!(task.await.unwrap(), 2);
    }
}

//! # Authenticated Policy Broadcast
//!
//! Fan-out of one [`PolicyUpdate`] to every trusted peer, fan-in of the
//! per-peer results into a single [`DeliveryReport`].
//!
//! ## Delivery Flow
//!
//! 1. Take one snapshot of the trust channel table for the whole broadcast
//! 2. Encode the update once
//! 3. For each peer other than the source:
//!    - no channel key: record `Untrusted` and move on
//!    - otherwise seal the payload under the `source -> peer` key and hand it
//!      to the transport in its own task
//! 4. Join every delivery task before returning
//!
//! Partial failure is the normal case under churn and never aborts the
//! broadcast. Retries are left to the transport.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::auth::TrustedPeerSet;
use crate::channels::TrustChannels;
use crate::identity::ControllerId;
use crate::messages::{serialize, Envelope, PolicyUpdate};
use crate::protocols::{SendOutcome, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transport could not reach the peer.
    Unreachable,
    /// No trust channel to the peer.
    Untrusted,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Unreachable => write!(f, "peer-unreachable"),
            Self::Untrusted => write!(f, "untrusted or revoked peer"),
        }
    }
}

/// Per-peer outcomes of one broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    outcomes: BTreeMap<ControllerId, DeliveryOutcome>,
}

impl DeliveryReport {
    fn record(&mut self, peer: ControllerId, outcome: DeliveryOutcome) {
        self.outcomes.insert(peer, outcome);
    }

    pub fn outcome(&self, peer: &ControllerId) -> Option<DeliveryOutcome> {
        self.outcomes.get(peer).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ControllerId, DeliveryOutcome)> {
        self.outcomes.iter().map(|(peer, outcome)| (peer, *outcome))
    }

    fn count(&self, wanted: DeliveryOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == wanted).count()
    }

    pub fn delivered(&self) -> usize {
        self.count(DeliveryOutcome::Delivered)
    }

    pub fn unreachable(&self) -> usize {
        self.count(DeliveryOutcome::Unreachable)
    }

    pub fn untrusted(&self) -> usize {
        self.count(DeliveryOutcome::Untrusted)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn all_delivered(&self) -> bool {
        self.delivered() == self.len()
    }
}

pub struct Broadcaster<T: Transport> {
    channels: Arc<TrustChannels>,
    transport: Arc<T>,
}

impl<T: Transport> Broadcaster<T> {
    pub fn new(channels: Arc<TrustChannels>, transport: Arc<T>) -> Self {
        Self {
            channels,
            transport,
        }
    }

    pub fn channels(&self) -> &Arc<TrustChannels> {
        &self.channels
    }

    /// Send `update` from `source` to every other member of `trusted`.
    ///
    /// Only a failure to encode the update is an error; every per-peer
    /// failure is recorded in the report.
    pub async fn broadcast(
        &self,
        source: &ControllerId,
        update: &PolicyUpdate,
        trusted: &TrustedPeerSet,
    ) -> Result<DeliveryReport> {
        let table = self.channels.snapshot();
        let payload = serialize(update).context("failed to encode policy update")?;

        let mut report = DeliveryReport::default();
        let mut join_set = JoinSet::new();
        let mut pending = BTreeSet::new();

        for peer in trusted {
            if peer == source {
                continue;
            }
            let key = match table.lookup(source, peer) {
                Ok(key) => key,
                Err(e) => {
                    warn!(%peer, error = %e, "skipping delivery");
                    report.record(peer.clone(), DeliveryOutcome::Untrusted);
                    continue;
                }
            };

            let envelope = Envelope::seal(&key, source.clone(), peer.clone(), payload.clone());
            let transport = self.transport.clone();
            let destination = peer.clone();
            join_set.spawn(async move {
                let outcome = transport.send(&destination, envelope).await;
                (destination, outcome)
            });
            pending.insert(peer.clone());
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((peer, sent)) => {
                    let outcome = match sent {
                        SendOutcome::Ok => DeliveryOutcome::Delivered,
                        SendOutcome::Unreachable => DeliveryOutcome::Unreachable,
                    };
                    debug!(%peer, %outcome, seqno = update.seqno, "delivery finished");
                    pending.remove(&peer);
                    report.record(peer, outcome);
                }
                Err(e) => warn!(error = %e, "delivery task failed"),
            }
        }

        // Deliveries whose task died never reported back.
        for peer in pending {
            report.record(peer, DeliveryOutcome::Unreachable);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::adaptation::AdaptationReason;
    use crate::channels::TrustChannelTable;
    use crate::identity::{KeyDirectory, SharedSecret};
    use crate::messages::deserialize_bounded;
    use crate::metrics::MetricsSample;

    fn id(s: &str) -> ControllerId {
        ControllerId::new(s).unwrap()
    }

    #[derive(Default)]
    struct RecordingTransport {
        unreachable: HashSet<ControllerId>,
        sent: Mutex<Vec<(ControllerId, Envelope)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, destination: &ControllerId, envelope: Envelope) -> SendOutcome {
            if self.unreachable.contains(destination) {
                return SendOutcome::Unreachable;
            }
            self.sent.lock().unwrap().push((destination.clone(), envelope));
            SendOutcome::Ok
        }
    }

    fn fixture() -> (KeyDirectory, TrustedPeerSet) {
        let directory: KeyDirectory = ["ctrlA", "ctrlB", "ctrlC"]
            .into_iter()
            .map(|c| (id(c), SharedSecret::new(format!("{c}_secret").into_bytes()).unwrap()))
            .collect();
        let trusted = directory.identities().cloned().collect();
        (directory, trusted)
    }

    fn update() -> PolicyUpdate {
        PolicyUpdate::for_adaptation(
            1,
            id("ctrlA"),
            0,
            &[AdaptationReason::LoadThreshold],
            MetricsSample::new(1.5, 0.1, false).unwrap(),
        )
    }

    #[tokio::test]
    async fn delivers_to_every_other_peer() {
        let (directory, trusted) = fixture();
        let channels = Arc::new(TrustChannels::establish(directory, trusted.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let broadcaster = Broadcaster::new(channels.clone(), transport.clone());

        let report = broadcaster.broadcast(&id("ctrlA"), &update(), &trusted).await.unwrap();

        assert_eq!(report.len(), 2);
        assert!(report.all_delivered());
        assert_eq!(report.outcome(&id("ctrlA")), None);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let table = channels.snapshot();
        for (destination, envelope) in sent.iter() {
            assert_eq!(&envelope.destination, destination);
            let key = table.lookup(&id("ctrlA"), destination).unwrap();
            assert!(envelope.verify(&key).is_ok());
            let decoded: PolicyUpdate = deserialize_bounded(&envelope.payload).unwrap();
            assert_eq!(decoded, update());
        }
    }

    #[tokio::test]
    async fn missing_channel_is_reported_per_peer() {
        let (directory, trusted) = fixture();
        let table = TrustChannelTable::build(&directory, &trusted).without_pair(&id("ctrlA"), &id("ctrlC"));
        let channels = Arc::new(TrustChannels::from_table(directory, trusted.clone(), table));
        let broadcaster = Broadcaster::new(channels, Arc::new(RecordingTransport::default()));

        let report = broadcaster.broadcast(&id("ctrlA"), &update(), &trusted).await.unwrap();

        assert_eq!(report.outcome(&id("ctrlB")), Some(DeliveryOutcome::Delivered));
        assert_eq!(report.outcome(&id("ctrlC")), Some(DeliveryOutcome::Untrusted));
        assert_eq!(report.untrusted(), 1);
        assert!(!report.all_delivered());
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_abort_broadcast() {
        let (directory, trusted) = fixture();
        let channels = Arc::new(TrustChannels::establish(directory, trusted.clone()));
        let transport = Arc::new(RecordingTransport {
            unreachable: [id("ctrlB")].into_iter().collect(),
            ..Default::default()
        });
        let broadcaster = Broadcaster::new(channels, transport);

        let report = broadcaster.broadcast(&id("ctrlA"), &update(), &trusted).await.unwrap();

        assert_eq!(report.outcome(&id("ctrlB")), Some(DeliveryOutcome::Unreachable));
        assert_eq!(report.outcome(&id("ctrlC")), Some(DeliveryOutcome::Delivered));
        assert_eq!(report.unreachable(), 1);
        assert_eq!(report.delivered(), 1);
    }

    #[tokio::test]
    async fn lone_controller_broadcasts_to_nobody() {
        let (directory, _) = fixture();
        let trusted: TrustedPeerSet = [id("ctrlA")].into_iter().collect();
        let channels = Arc::new(TrustChannels::establish(directory, trusted.clone()));
        let broadcaster = Broadcaster::new(channels, Arc::new(RecordingTransport::default()));

        let report = broadcaster.broadcast(&id("ctrlA"), &update(), &trusted).await.unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(DeliveryOutcome::Delivered.to_string(), "delivered");
        assert_eq!(DeliveryOutcome::Unreachable.to_string(), "peer-unreachable");
        assert_eq!(DeliveryOutcome::Untrusted.to_string(), "untrusted or revoked peer");
    }
}

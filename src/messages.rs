//! # Wire Messages
//!
//! Serializable types exchanged over trust channels. Messages are serialized
//! with bincode; decoding always goes through size-bounded options.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`PolicyUpdate`] | Load-balancing policy hint disseminated on adaptation |
//! | [`Envelope`] | A payload sealed for one directed channel |
//!
//! ## Envelope Authentication
//!
//! The MAC covers `ENVELOPE_MAC_DOMAIN || len(source) || source ||
//! len(destination) || destination || payload` under the channel's session
//! key. Binding both endpoints means a sealed payload cannot be replayed on a
//! different channel, even one that happens to share a key.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::adaptation::AdaptationReason;
use crate::crypto::{
    mac_with_domain, verify_mac_with_domain, MacError, SessionKey, ENVELOPE_MAC_DOMAIN,
};
use crate::identity::ControllerId;
use crate::metrics::MetricsSample;

/// Maximum encoded size of a policy update payload.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Maximum buffer size for deserialization, with room for envelope framing.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Load-balancing action requested from peer controllers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    /// Re-weight backend servers away from the overloaded pool.
    AdjustServerWeights,
    /// Serve alert-tagged queues first.
    PrioritizeAlertQueues,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    /// Per-issuer sequence number; strictly increasing.
    pub seqno: u64,
    pub issuer: ControllerId,
    pub issued_at_ms: u64,
    pub reasons: Vec<AdaptationReason>,
    pub sample: MetricsSample,
    pub actions: Vec<PolicyAction>,
}

impl PolicyUpdate {
    /// Build the update disseminated for an adaptation triggered by `sample`.
    ///
    /// Server weights are always adjusted; alert queues are prioritized only
    /// when the sample carried a congestion alert.
    pub fn for_adaptation(
        seqno: u64,
        issuer: ControllerId,
        issued_at_ms: u64,
        reasons: &[AdaptationReason],
        sample: MetricsSample,
    ) -> Self {
        let mut actions = vec![PolicyAction::AdjustServerWeights];
        if reasons.contains(&AdaptationReason::CongestionAlert) {
            actions.push(PolicyAction::PrioritizeAlertQueues);
        }
        Self {
            seqno,
            issuer,
            issued_at_ms,
            reasons: reasons.to_vec(),
            sample,
            actions,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: ControllerId,
    pub destination: ControllerId,
    pub payload: Vec<u8>,
    pub mac: Vec<u8>,
}

impl Envelope {
    fn build_authenticated_payload(
        source: &ControllerId,
        destination: &ControllerId,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            16 + source.as_str().len() + destination.as_str().len() + payload.len(),
        );
        data.extend_from_slice(&(source.as_str().len() as u64).to_le_bytes());
        data.extend_from_slice(source.as_bytes());
        data.extend_from_slice(&(destination.as_str().len() as u64).to_le_bytes());
        data.extend_from_slice(destination.as_bytes());
        data.extend_from_slice(payload);
        data
    }

    /// Seal `payload` for the `source -> destination` channel.
    pub fn seal(
        key: &SessionKey,
        source: ControllerId,
        destination: ControllerId,
        payload: Vec<u8>,
    ) -> Self {
        let data = Self::build_authenticated_payload(&source, &destination, &payload);
        let mac = mac_with_domain(key, ENVELOPE_MAC_DOMAIN, &data).to_vec();
        Self {
            source,
            destination,
            payload,
            mac,
        }
    }

    /// Check the MAC under the channel key.
    pub fn verify(&self, key: &SessionKey) -> Result<(), MacError> {
        let data = Self::build_authenticated_payload(&self.source, &self.destination, &self.payload);
        verify_mac_with_domain(key, ENVELOPE_MAC_DOMAIN, &data, &self.mac)
    }
}

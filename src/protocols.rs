//! Collaborator traits the coordination core talks through.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Transport | [`Transport`] | Hand a sealed envelope to one peer controller |
//! | Metrics | [`MetricsSource`](crate::metrics::MetricsSource) | Supply one sample per tick |
//!
//! The core assembles and authenticates every payload itself. Implementations
//! own actual network delivery, retries and timeouts.

use async_trait::async_trait;

use crate::identity::ControllerId;
use crate::messages::Envelope;

/// What the transport reports for one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    Unreachable,
}

/// Point-to-point delivery of sealed envelopes to peer controllers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, destination: &ControllerId, envelope: Envelope) -> SendOutcome;
}

//! # Stam - Secure Trust-Aware Multi-Controller Coordination
//!
//! Stam lets a small group of network controllers detect overload on their
//! own, agree on mutual trust, and push authenticated policy updates to one
//! another without a central authority:
//!
//! - **Authentication**: controllers prove knowledge of a pre-shared secret
//! - **Trust Channels**: one directional session key per ordered pair of trusted peers
//! - **Adaptation**: threshold checks on each metrics sample, one cycle at a time
//! - **Broadcast**: every trusted peer gets its own MAC-sealed copy of the update
//! - **Feedback**: the sample after an adaptation is compared to the one that triggered it
//!
//! ## Architecture
//!
//! The coordination core never touches the network or a metrics backend
//! directly. Both sit behind traits ([`Transport`], [`MetricsSource`]) so the
//! same core runs against loopback channels in tests and real links in
//! deployment.
//!
//! ## Security Model
//!
//! - Proofs are compared in constant time; unknown identities cost the same as known ones
//! - Session keys are derived with BLAKE3 in key-derivation mode and never leave the process
//! - The channel table is published as an immutable snapshot; rotation and
//!   revocation swap in a new one
//! - Receivers reject misaddressed, forged, spoofed and replayed updates
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Controller ids, shared secrets, key directory |
//! | `auth` | Proof-of-secret authentication, trusted peer set |
//! | `crypto` | Session key derivation and keyed MACs |
//! | `channels` | Trust channel table and its snapshot publisher |
//! | `metrics` | Metrics samples and the source trait |
//! | `adaptation` | Threshold evaluation and the Stable/Adapting state machine |
//! | `messages` | Policy updates, sealed envelopes, bounded bincode |
//! | `protocols` | Transport trait |
//! | `broadcast` | Fan-out of sealed updates with per-peer outcomes |
//! | `listener` | Inbound envelope verification and replay rejection |
//! | `feedback` | Before/after improvement reports |
//! | `coordinator` | Monitoring cycle and the non-overlapping periodic driver |
//! | `config` | Coordinator tunables and TOML deployment config |

mod adaptation;
mod auth;
mod broadcast;
mod channels;
mod config;
mod coordinator;
mod crypto;
mod feedback;
mod identity;
mod listener;
mod messages;
mod metrics;
mod protocols;

pub use adaptation::{
    AdaptationDecision, AdaptationEvaluator, AdaptationReason, ControllerState, Transition,
};
pub use auth::{Authenticator, TrustedPeerSet};
pub use broadcast::{Broadcaster, DeliveryOutcome, DeliveryReport};
pub use channels::{ChannelPair, KeyNotFound, TrustChannelTable, TrustChannels};
pub use config::{
    ConfigError, ControllerClaim, CoordinatorConfig, StamConfig, DEFAULT_DELAY_THRESHOLD,
    DEFAULT_IMPROVEMENT_TOLERANCE, DEFAULT_LOAD_THRESHOLD, DEFAULT_TICK_INTERVAL_MS,
};
pub use coordinator::{Coordinator, CycleOutcome, Driver, DriverStats};
pub use crypto::{
    derive_session_key, mac_with_domain, verify_mac_with_domain, DeriveError, MacError,
    SessionKey, SessionKeyDeriver,
};
pub use feedback::{DimensionDelta, FeedbackMonitor, ImprovementReport};
pub use identity::{ControllerId, IdentityError, KeyDirectory, SharedSecret};
pub use listener::{ListenerError, PeerListener};
pub use messages::{deserialize_bounded, serialize, Envelope, PolicyAction, PolicyUpdate};
pub use metrics::{MetricsSample, MetricsSource, SampleError};
pub use protocols::{SendOutcome, Transport};

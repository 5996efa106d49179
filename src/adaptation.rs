//! # Adaptation Evaluator
//!
//! Decides from one [`MetricsSample`] whether system-wide adaptation is
//! required, and tracks whether an adaptation cycle is in flight.
//!
//! ## State Machine
//!
//! | From | Event | To |
//! |------|-------|----|
//! | `Stable` | sample breaches a threshold or carries a congestion alert | `Adapting` |
//! | `Stable` | quiet sample | `Stable` |
//! | `Adapting` | any sample | `Adapting` (triggers are coalesced) |
//! | `Adapting` | feedback cycle completed | `Stable` |
//!
//! Once armed, a cycle must observe feedback before the evaluator re-arms, so
//! a persistently overloaded controller broadcasts once per cycle rather than
//! once per tick.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::CoordinatorConfig;
use crate::metrics::MetricsSample;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Stable,
    Adapting,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Adapting => write!(f, "adapting"),
        }
    }
}

/// Why a sample requires adaptation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdaptationReason {
    LoadThreshold,
    DelayThreshold,
    CongestionAlert,
}

impl fmt::Display for AdaptationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadThreshold => write!(f, "load-threshold"),
            Self::DelayThreshold => write!(f, "delay-threshold"),
            Self::CongestionAlert => write!(f, "congestion-alert"),
        }
    }
}

/// Deterministic verdict for one sample.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdaptationDecision {
    reasons: Vec<AdaptationReason>,
}

impl AdaptationDecision {
    pub fn required(&self) -> bool {
        !self.reasons.is_empty()
    }

    /// Reasons in a fixed order: load, delay, congestion.
    pub fn reasons(&self) -> &[AdaptationReason] {
        &self.reasons
    }
}

/// Result of feeding one sample to the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `Stable -> Adapting`: a new cycle starts with this decision.
    Armed(AdaptationDecision),
    /// Already `Adapting`; a trigger in this sample joins the current cycle.
    Coalesced(AdaptationDecision),
    /// `Stable` and nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct AdaptationEvaluator {
    load_threshold: f64,
    delay_threshold: f64,
    state: ControllerState,
    coalesced: u32,
}

impl AdaptationEvaluator {
    pub fn new(load_threshold: f64, delay_threshold: f64) -> Self {
        Self {
            load_threshold,
            delay_threshold,
            state: ControllerState::Stable,
            coalesced: 0,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.load_threshold, config.delay_threshold)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Pure threshold check, independent of the current state.
    pub fn decide(&self, sample: &MetricsSample) -> AdaptationDecision {
        let mut reasons = Vec::new();
        if sample.traffic_volume() > self.load_threshold {
            reasons.push(AdaptationReason::LoadThreshold);
        }
        if sample.delay() > self.delay_threshold {
            reasons.push(AdaptationReason::DelayThreshold);
        }
        if sample.congestion_alert() {
            reasons.push(AdaptationReason::CongestionAlert);
        }
        AdaptationDecision { reasons }
    }

    pub fn on_sample(&mut self, sample: &MetricsSample) -> Transition {
        let decision = self.decide(sample);
        match self.state {
            ControllerState::Stable if decision.required() => {
                self.state = ControllerState::Adapting;
                self.coalesced = 0;
                Transition::Armed(decision)
            }
            ControllerState::Stable => Transition::Idle,
            ControllerState::Adapting => {
                if decision.required() {
                    self.coalesced += 1;
                }
                Transition::Coalesced(decision)
            }
        }
    }

    /// Close the in-flight cycle and re-arm. Returns how many triggers were
    /// folded into it. No-op when already `Stable`.
    pub fn complete_cycle(&mut self) -> u32 {
        self.state = ControllerState::Stable;
        std::mem::take(&mut self.coalesced)
    }
}

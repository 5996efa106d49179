//! Traffic metrics samples and the source trait the driver pulls them from.
//!
//! The core never fabricates samples. Whatever feeds it (a telemetry poller,
//! a push subscription, the synthetic generator in the binary) implements
//! [`MetricsSource`].

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Rejected sample fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleError {
    /// Traffic volume is negative, NaN or infinite.
    InvalidTrafficVolume,
    /// Delay is negative, NaN or infinite.
    InvalidDelay,
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTrafficVolume => {
                write!(f, "traffic volume must be a finite non-negative number")
            }
            Self::InvalidDelay => write!(f, "delay must be a finite non-negative number"),
        }
    }
}

impl std::error::Error for SampleError {}

/// One monitoring tick's worth of load, delay and congestion data.
///
/// Fields are private so a sample cannot be altered once created.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSample")]
pub struct MetricsSample {
    traffic_volume: f64,
    delay: f64,
    congestion_alert: bool,
}

impl MetricsSample {
    pub fn new(traffic_volume: f64, delay: f64, congestion_alert: bool) -> Result<Self, SampleError> {
        if !(traffic_volume.is_finite() && traffic_volume >= 0.0) {
            return Err(SampleError::InvalidTrafficVolume);
        }
        if !(delay.is_finite() && delay >= 0.0) {
            return Err(SampleError::InvalidDelay);
        }
        Ok(Self {
            traffic_volume,
            delay,
            congestion_alert,
        })
    }

    #[inline]
    pub fn traffic_volume(&self) -> f64 {
        self.traffic_volume
    }

    #[inline]
    pub fn delay(&self) -> f64 {
        self.delay
    }

    #[inline]
    pub fn congestion_alert(&self) -> bool {
        self.congestion_alert
    }
}

/// Wire shape of [`MetricsSample`], checked through [`MetricsSample::new`]
/// on the way in.
#[derive(Serialize, Deserialize)]
struct RawSample {
    traffic_volume: f64,
    delay: f64,
    congestion_alert: bool,
}

impl TryFrom<RawSample> for MetricsSample {
    type Error = SampleError;

    fn try_from(raw: RawSample) -> Result<Self, Self::Error> {
        Self::new(raw.traffic_volume, raw.delay, raw.congestion_alert)
    }
}

/// Producer of metrics samples, one per monitoring tick.
#[async_trait]
pub trait MetricsSource: Send + 'static {
    /// Return the next complete sample. An error fails only the current tick.
    async fn next_sample(&mut self) -> Result<MetricsSample>;
}

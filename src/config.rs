//! # Configuration
//!
//! Tunables of the adaptive control loop ([`CoordinatorConfig`]) and the
//! deployment description a controller starts from ([`StamConfig`]): its own
//! identity, the controllers it should authenticate, and the shared keys.
//!
//! ## File Format
//!
//! ```toml
//! controller_id = "ctrlA"
//!
//! [coordinator]
//! load_threshold = 1.0
//! delay_threshold = 0.3
//! tick_interval_ms = 6000
//! improvement_tolerance = 0.0
//!
//! [[controllers]]
//! id = "ctrlA"
//! proof = "alpha_secret"
//!
//! [shared_keys]
//! ctrlA = "alpha_secret"
//! ctrlB = "beta_secret"
//! ```
//!
//! Every field of `[coordinator]` is optional and falls back to its default.
//! A configuration that fails [`StamConfig::validate`] is fatal: the process
//! does not start.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::identity::{ControllerId, IdentityError, KeyDirectory, SharedSecret};

/// Default traffic volume above which adaptation is triggered.
pub const DEFAULT_LOAD_THRESHOLD: f64 = 1.0;

/// Default delay above which adaptation is triggered.
pub const DEFAULT_DELAY_THRESHOLD: f64 = 0.3;

/// Default monitoring interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 6000;

/// Default slack subtracted from the baseline before a dimension counts as
/// improved.
pub const DEFAULT_IMPROVEMENT_TOLERANCE: f64 = 0.0;

/// Upper bound on the monitoring interval (one day).
pub const MAX_TICK_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Load threshold is negative, NaN or infinite.
    InvalidLoadThreshold(f64),
    /// Delay threshold is negative, NaN or infinite.
    InvalidDelayThreshold(f64),
    /// Tick interval is zero or above [`MAX_TICK_INTERVAL_MS`].
    InvalidTickInterval(u64),
    /// Improvement tolerance is negative, NaN or infinite.
    InvalidImprovementTolerance(f64),
    /// A controller identity in the file is malformed.
    InvalidControllerId(String, IdentityError),
    /// A shared key is empty.
    InvalidSecret(String),
    /// The local controller has no shared key.
    UnknownLocalController(String),
    /// The file is not valid TOML or does not match the schema.
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLoadThreshold(v) => {
                write!(f, "load_threshold must be finite and non-negative, got {v}")
            }
            Self::InvalidDelayThreshold(v) => {
                write!(f, "delay_threshold must be finite and non-negative, got {v}")
            }
            Self::InvalidTickInterval(v) => write!(
                f,
                "tick_interval_ms must be between 1 and {MAX_TICK_INTERVAL_MS}, got {v}"
            ),
            Self::InvalidImprovementTolerance(v) => write!(
                f,
                "improvement_tolerance must be finite and non-negative, got {v}"
            ),
            Self::InvalidControllerId(id, e) => write!(f, "controller {id:?}: {e}"),
            Self::InvalidSecret(id) => write!(f, "shared key for {id:?} is empty"),
            Self::UnknownLocalController(id) => {
                write!(f, "local controller {id:?} has no entry in shared_keys")
            }
            Self::Parse(msg) => write!(f, "malformed configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Adaptive control loop tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Traffic volume above which the controller is considered overloaded.
    pub load_threshold: f64,
    /// Delay above which the controller is considered overloaded.
    pub delay_threshold: f64,
    /// Interval between monitoring ticks.
    pub tick_interval_ms: u64,
    /// Slack applied when judging whether an adaptation helped.
    pub improvement_tolerance: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            load_threshold: DEFAULT_LOAD_THRESHOLD,
            delay_threshold: DEFAULT_DELAY_THRESHOLD,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            improvement_tolerance: DEFAULT_IMPROVEMENT_TOLERANCE,
        }
    }
}

fn finite_non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !finite_non_negative(self.load_threshold) {
            return Err(ConfigError::InvalidLoadThreshold(self.load_threshold));
        }
        if !finite_non_negative(self.delay_threshold) {
            return Err(ConfigError::InvalidDelayThreshold(self.delay_threshold));
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms > MAX_TICK_INTERVAL_MS {
            return Err(ConfigError::InvalidTickInterval(self.tick_interval_ms));
        }
        if !finite_non_negative(self.improvement_tolerance) {
            return Err(ConfigError::InvalidImprovementTolerance(
                self.improvement_tolerance,
            ));
        }
        Ok(())
    }
}

/// A controller presenting itself for authentication at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerClaim {
    pub id: String,
    pub proof: String,
}

/// Full startup description of one controller's view of the deployment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StamConfig {
    /// Identity of the controller running this process.
    pub controller_id: String,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub controllers: Vec<ControllerClaim>,
    #[serde(default)]
    pub shared_keys: BTreeMap<String, String>,
}

impl StamConfig {
    /// Two-controller deployment used when no file is given.
    pub fn demo() -> Self {
        let keys = [("ctrlA", "alpha_secret"), ("ctrlB", "beta_secret")];
        Self {
            controller_id: "ctrlA".to_string(),
            coordinator: CoordinatorConfig::default(),
            controllers: keys
                .iter()
                .map(|(id, proof)| ControllerClaim {
                    id: id.to_string(),
                    proof: proof.to_string(),
                })
                .collect(),
            shared_keys: keys
                .iter()
                .map(|(id, key)| (id.to_string(), key.to_string()))
                .collect(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.local_controller()?;
        self.key_directory()?;
        for claim in &self.controllers {
            ControllerId::new(claim.id.as_str())
                .map_err(|e| ConfigError::InvalidControllerId(claim.id.clone(), e))?;
        }
        if !self.shared_keys.contains_key(&self.controller_id) {
            return Err(ConfigError::UnknownLocalController(self.controller_id.clone()));
        }
        Ok(())
    }

    pub fn local_controller(&self) -> Result<ControllerId, ConfigError> {
        ControllerId::new(self.controller_id.as_str())
            .map_err(|e| ConfigError::InvalidControllerId(self.controller_id.clone(), e))
    }

    pub fn key_directory(&self) -> Result<KeyDirectory, ConfigError> {
        self.shared_keys
            .iter()
            .map(|(id, key)| {
                let controller = ControllerId::new(id.as_str())
                    .map_err(|e| ConfigError::InvalidControllerId(id.clone(), e))?;
                let secret = SharedSecret::new(key.as_bytes().to_vec())
                    .map_err(|_| ConfigError::InvalidSecret(id.clone()))?;
                Ok((controller, secret))
            })
            .collect()
    }

    /// Authentication claims in file order, ready for
    /// [`Authenticator::authenticate_all`](crate::auth::Authenticator::authenticate_all).
    pub fn claims(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.controllers
            .iter()
            .map(|c| (c.id.as_str(), c.proof.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.load_threshold, 1.0);
        assert_eq!(config.delay_threshold, 0.3);
        assert_eq!(config.tick_interval_ms, 6000);
        assert_eq!(config.improvement_tolerance, 0.0);
        assert_eq!(config.tick_interval(), Duration::from_secs(6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_tunables_are_rejected() {
        let bad = [
            (
                CoordinatorConfig { load_threshold: -1.0, ..Default::default() },
                ConfigError::InvalidLoadThreshold(-1.0),
            ),
            (
                CoordinatorConfig { tick_interval_ms: 0, ..Default::default() },
                ConfigError::InvalidTickInterval(0),
            ),
            (
                CoordinatorConfig { improvement_tolerance: -0.5, ..Default::default() },
                ConfigError::InvalidImprovementTolerance(-0.5),
            ),
        ];
        for (config, expected) in bad {
            assert_eq!(config.validate(), Err(expected));
        }

        let nan = CoordinatorConfig { delay_threshold: f64::NAN, ..Default::default() };
        assert!(matches!(nan.validate(), Err(ConfigError::InvalidDelayThreshold(_))));
    }

    #[test]
    fn parses_full_file() {
        let text = r#"
            controller_id = "ctrlA"

            [coordinator]
            load_threshold = 0.9
            tick_interval_ms = 250

            [[controllers]]
            id = "ctrlA"
            proof = "alpha_secret"

            [[controllers]]
            id = "ctrlB"
            proof = "beta_secret"

            [shared_keys]
            ctrlA = "alpha_secret"
            ctrlB = "beta_secret"
        "#;
        let config = StamConfig::from_toml(text).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.load_threshold, 0.9);
        assert_eq!(config.coordinator.delay_threshold, DEFAULT_DELAY_THRESHOLD);
        assert_eq!(config.coordinator.tick_interval_ms, 250);
        assert_eq!(config.controllers.len(), 2);
        assert_eq!(config.key_directory().unwrap().len(), 2);

        let claims: Vec<_> = config.claims().map(|(id, _)| id).collect();
        assert_eq!(claims, vec!["ctrlA", "ctrlB"]);
    }

    #[test]
    fn unknown_fields_are_a_parse_error() {
        let text = r#"
            controller_id = "ctrlA"
            [coordinator]
            load_treshold = 2.0
        "#;
        assert!(matches!(StamConfig::from_toml(text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn local_controller_needs_a_shared_key() {
        let mut config = StamConfig::demo();
        config.controller_id = "ctrlZ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownLocalController("ctrlZ".to_string()))
        );
    }

    #[test]
    fn empty_shared_key_is_rejected() {
        let mut config = StamConfig::demo();
        config.shared_keys.insert("ctrlC".to_string(), String::new());
        assert_eq!(config.validate(), Err(ConfigError::InvalidSecret("ctrlC".to_string())));
    }

    #[test]
    fn malformed_identity_is_rejected() {
        let mut config = StamConfig::demo();
        config.controllers.push(ControllerClaim {
            id: "ctrl C".to_string(),
            proof: "x".to_string(),
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidControllerId(
                "ctrl C".to_string(),
                IdentityError::InvalidCharacters
            ))
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = StamConfig::load(Path::new("/nonexistent/stam.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}

//! Process-wide configuration for the TGDH protocol
//!
//! The modular group `(g, p)` is immutable, process-wide configuration with
//! initialise-once semantics (see the design notes on "Global key
//! parameters"): load it once, then hand it down by reference.

use crate::errors::{Result, TgdhError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The modular Diffie-Hellman group and the handful of protocol-level
/// knobs this crate needs.
///
/// `generator` and `modulus` are decimal strings rather than a fixed-width
/// integer type so this crate has no dependency on the big-integer library
/// `tgdh-crypto` uses to parse them; the interface must accept arbitrary
/// width values, and a `String` never overflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Generator `g`, as a decimal string
    pub generator: String,
    /// Prime modulus `p`, as a decimal string
    pub modulus: String,
    /// How long the coordinator waits for a level's acknowledgements
    /// before surfacing `TransportFailure`
    pub ack_timeout_ms: u64,
    /// Optional fixed seed for the private-key RNG, for deterministic tests
    pub rng_seed: Option<u64>,
}

impl Default for GroupConfig {
    /// The `g=5, p=23` demonstration parameters, so a binary or test can
    /// run with zero configuration.
    fn default() -> Self {
        Self {
            generator: "5".to_string(),
            modulus: "23".to_string(),
            ack_timeout_ms: 5_000,
            rng_seed: None,
        }
    }
}

impl GroupConfig {
    /// Load configuration from a TOML file, falling back to no fields
    /// unset from `Default` (via serde's own default handling on missing
    /// keys is not assumed; every field here is required in the file).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            TgdhError::configuration(format!("reading {}: {err}", path.display()))
        })?;
        let config: GroupConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configuration that cannot possibly describe a valid group
    pub fn validate(&self) -> Result<()> {
        if self.generator.trim().is_empty() || self.modulus.trim().is_empty() {
            return Err(TgdhError::configuration(
                "generator and modulus must be non-empty decimal strings",
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(TgdhError::configuration(
                "ack_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_the_demonstration_group() {
        let config = GroupConfig::default();
        assert_eq!(config.generator, "5");
        assert_eq!(config.modulus, "23");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_modulus_fails_validation() {
        let mut config = GroupConfig::default();
        config.modulus = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let mut config = GroupConfig {
            ack_timeout_ms: 0,
            ..GroupConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TgdhError::Configuration { .. })
        ));
        config.ack_timeout_ms = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_rejects_a_missing_path() {
        let err = GroupConfig::from_file("/nonexistent/tgdh.toml").unwrap_err();
        assert!(matches!(err, TgdhError::Configuration { .. }));
    }
}

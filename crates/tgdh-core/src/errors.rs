//! Unified error system for the TGDH crates
//!
//! A single, flat error type carries every failure kind the TGDH protocol
//! can surface, following this codebase's convention of one error enum per
//! crate family rather than a type per module.

use serde::{Deserialize, Serialize};

/// Unified error type for all TGDH operations
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum TgdhError {
    /// Only one member remains after a leave; the group is effectively gone
    #[error("group is empty: {message}")]
    GroupEmpty {
        /// Human-readable detail
        message: String,
    },

    /// A leave (or lookup) was requested for a member ID the tree has no leaf for
    #[error("invalid member {mid}: {message}")]
    InvalidMember {
        /// The member ID that was not found
        mid: u64,
        /// Human-readable detail
        message: String,
    },

    /// A message arrived that does not match the expected level or target node
    #[error("protocol state violation: {message}")]
    ProtocolState {
        /// Human-readable detail
        message: String,
    },

    /// A blind value was zero, negative, or not less than the modulus
    #[error("bad key material: {message}")]
    BadKeyMaterial {
        /// Human-readable detail
        message: String,
    },

    /// The Messenger reported a transport-level failure
    #[error("transport failure: {message}")]
    TransportFailure {
        /// Human-readable detail
        message: String,
    },

    /// Configuration could not be loaded or parsed
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable detail
        message: String,
    },

    /// Serialization or deserialization of a wire payload failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable detail
        message: String,
    },
}

impl TgdhError {
    /// Construct a `GroupEmpty` error
    pub fn group_empty(message: impl Into<String>) -> Self {
        Self::GroupEmpty {
            message: message.into(),
        }
    }

    /// Construct an `InvalidMember` error
    pub fn invalid_member(mid: u64, message: impl Into<String>) -> Self {
        Self::InvalidMember {
            mid,
            message: message.into(),
        }
    }

    /// Construct a `ProtocolState` error
    pub fn protocol_state(message: impl Into<String>) -> Self {
        Self::ProtocolState {
            message: message.into(),
        }
    }

    /// Construct a `BadKeyMaterial` error
    pub fn bad_key_material(message: impl Into<String>) -> Self {
        Self::BadKeyMaterial {
            message: message.into(),
        }
    }

    /// Construct a `TransportFailure` error
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    /// Construct a `Configuration` error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Construct a `Serialization` error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the caller may reasonably retry the operation that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure { .. } | Self::ProtocolState { .. })
    }

    /// Stable category tag, useful for metrics and log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::GroupEmpty { .. } => "group_empty",
            Self::InvalidMember { .. } => "invalid_member",
            Self::ProtocolState { .. } => "protocol_state",
            Self::BadKeyMaterial { .. } => "bad_key_material",
            Self::TransportFailure { .. } => "transport_failure",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Standard result type for TGDH operations
pub type Result<T> = std::result::Result<T, TgdhError>;

impl From<serde_json::Error> for TgdhError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TgdhError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_the_right_variant() {
        let err = TgdhError::invalid_member(7, "no such leaf");
        assert!(matches!(err, TgdhError::InvalidMember { mid: 7, .. }));
        assert_eq!(err.category(), "invalid_member");
    }

    #[test]
    fn retryability_matches_the_structural_vs_arithmetic_split() {
        assert!(TgdhError::transport_failure("dropped").is_retryable());
        assert!(TgdhError::protocol_state("wrong level").is_retryable());
        assert!(!TgdhError::group_empty("done").is_retryable());
        assert!(!TgdhError::bad_key_material("blind >= p").is_retryable());
        assert!(!TgdhError::invalid_member(1, "unknown").is_retryable());
    }

    #[test]
    fn display_includes_the_message() {
        let err = TgdhError::bad_key_material("blind value 0 is not invertible");
        assert!(err.to_string().contains("blind value 0"));
    }
}

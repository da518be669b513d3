use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for logging and advisory wording.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionErrorCategory {
    /// Invalid input or configuration.
    Config,
    /// Remote authentication failure.
    Auth,
    /// Transport open/teardown failure.
    Transport,
    /// Credential or projection persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Controller bug or invariant break.
    Internal,
}

/// Stable error payload used inside the controller.
///
/// Public controller operations never return it; it is logged and folded
/// into the instance advisory instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SessionError {
    /// High-level error category.
    pub category: SessionErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SessionError {
    pub fn new(
        category: SessionErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SessionErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while instance is {current:?}"),
        )
    }

    /// Build an error for work addressed to a superseded session generation.
    pub fn stale_generation(expected: u64, actual: u64) -> Self {
        Self::new(
            SessionErrorCategory::Internal,
            "stale_generation",
            format!("generation {actual} was superseded by {expected}"),
        )
    }

    /// Whether this error only signals that the request was already satisfied or superseded.
    pub fn is_benign(&self) -> bool {
        matches!(
            self.code.as_str(),
            "invalid_state_transition" | "stale_generation"
        )
    }
}

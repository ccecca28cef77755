//! PIMAP Error - Unified Error Types
//!
//! Error handling for every stage of the pipeline. Errors are grouped by the
//! boundary that produces them (input validation, storage, computation,
//! lifecycle) and carry a classification that drives the retry policy of the
//! metric engine.
//!
//! Key Features:
//! - Validation errors rejected synchronously at the ingest boundary
//! - Transient error detection for bounded retry
//! - Permanent failures recorded against a (scope, window, metric)
//! - Seamless integration with std::io::Error
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Unified error type for all PIMAP operations.
#[derive(Error, Debug)]
pub enum PimapError {
    // Validation errors
    #[error("malformed sample: {0}")]
    MalformedSample(String),

    #[error("malformed window: {0}")]
    MalformedWindow(String),

    #[error("duplicate sample with conflicting payload: {0}")]
    DuplicateSample(String),

    // Storage errors
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Computation errors
    #[error("domain error: {0}")]
    Domain(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // Lifecycle errors
    #[error("window not found: {0}")]
    WindowNotFound(String),

    #[error("metric already registered: {0}")]
    MetricAlreadyRegistered(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias for PIMAP operations.
pub type Result<T> = std::result::Result<T, PimapError>;

// =============================================================================
// Error Classification
// =============================================================================

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// May succeed if retried (store unavailable, timeout).
    Transient,
    /// Retrying cannot help (domain error, malformed input).
    Permanent,
}

impl PimapError {
    /// Returns true if the operation can be safely retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PimapError::StoreUnavailable(_) | PimapError::Timeout(_) | PimapError::Io(_)
        )
    }

    /// Returns true if this error was caused by caller input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PimapError::MalformedSample(_)
                | PimapError::MalformedWindow(_)
                | PimapError::DuplicateSample(_)
                | PimapError::Configuration(_)
        )
    }

    /// Classify the error for the retry policy.
    pub fn class(&self) -> FailureClass {
        if self.is_transient() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

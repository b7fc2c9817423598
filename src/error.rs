//! Error types for the state synchronization engine.
//!
//! This module provides a unified error type [`SyncError`] covering every
//! failure the engine, its collaborators and the reference adapters can report.
//!
//! # Design
//!
//! The error hierarchy is organized by boundary:
//! - [`SyncError::ConfigError`]: Configuration and environment issues
//! - [`SyncError::RpcError`]: RPC provider and network errors
//! - [`SyncError::DecodingError`]: Log decoding errors inside adapters
//! - [`SyncError::GenerationError`]: A protocol failed to build a snapshot from scratch
//! - [`SyncError::ProcessingError`]: A protocol failed to fold a log onto a snapshot
//! - [`SyncError::OrderingError`]: A log batch was rejected by the strict batch policy
//! - [`SyncError::CacheError`]: Shared cache reads, writes and publishes
//! - [`SyncError::SerializationError`]: Cache wire record encoding
//! - [`SyncError::DeliveryError`]: Registration with the log delivery service
//!
//! Cache errors are never propagated out of the engine; they are logged and
//! dropped. They still exist as a variant because the [`SharedCache`] trait
//! reports them.
//!
//! [`SharedCache`]: crate::cache::SharedCache
//!
//! # Example
//!
//! ```
//! use dex_state_sync::error::{SyncError, SyncResult};
//!
//! fn check_window(window: u64) -> SyncResult<()> {
//!     if window == 0 {
//!         return Err(SyncError::config("retention window cannot be zero", None));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;

/// Result type alias using [`SyncError`].
pub type SyncResult<T> = Result<T, SyncError>;

/// Boxed source error carried by most variants.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the synchronization engine.
#[derive(Debug)]
pub enum SyncError {
    /// Configuration or environment variable errors.
    ConfigError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// RPC provider or network errors.
    RpcError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Log decoding errors.
    ///
    /// Adapters should normally swallow these and report "no change" so that
    /// sibling logs in the same batch are not discarded.
    DecodingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Snapshot generation from scratch failed.
    ///
    /// The engine leaves its current state untouched and the caller (or the
    /// self-heal job) retries later.
    GenerationError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Folding a log onto a snapshot failed.
    ///
    /// Aborts the remainder of the `update` batch.
    ProcessingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// A log batch violated ordering or header requirements under the strict policy.
    OrderingError {
        /// Human-readable error message
        message: String,
    },

    /// Shared cache errors.
    CacheError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Cache wire record serialization errors.
    SerializationError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Log delivery service registration errors.
    DeliveryError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },
}

impl SyncError {
    /// Create a new configuration error.
    ///
    /// # Example
    ///
    /// ```
    /// use dex_state_sync::error::SyncError;
    ///
    /// let err = SyncError::config("SYNC_ROLE must be master or slave", None);
    /// assert!(matches!(err, SyncError::ConfigError { .. }));
    /// ```
    #[must_use]
    pub fn config(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::ConfigError {
            message: message.into(),
            source,
        }
    }

    /// Create a new RPC error.
    #[must_use]
    pub fn rpc(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::RpcError {
            message: message.into(),
            source,
        }
    }

    /// Create a new decoding error.
    #[must_use]
    pub fn decoding(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DecodingError {
            message: message.into(),
            source,
        }
    }

    /// Create a new generation error.
    ///
    /// # Example
    ///
    /// ```
    /// use dex_state_sync::error::SyncError;
    ///
    /// let err = SyncError::generation("no Sync event in lookback window", None);
    /// assert!(matches!(err, SyncError::GenerationError { .. }));
    /// ```
    #[must_use]
    pub fn generation(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::GenerationError {
            message: message.into(),
            source,
        }
    }

    /// Create a new processing error.
    #[must_use]
    pub fn processing(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::ProcessingError {
            message: message.into(),
            source,
        }
    }

    /// Create a new ordering error.
    #[must_use]
    pub fn ordering(message: impl Into<String>) -> Self {
        Self::OrderingError {
            message: message.into(),
        }
    }

    /// Create a new cache error.
    #[must_use]
    pub fn cache(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::CacheError {
            message: message.into(),
            source,
        }
    }

    /// Create a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create a new delivery error.
    #[must_use]
    pub fn delivery(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DeliveryError {
            message: message.into(),
            source,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError { message, .. } => write!(f, "Configuration error: {message}"),
            Self::RpcError { message, .. } => write!(f, "RPC error: {message}"),
            Self::DecodingError { message, .. } => write!(f, "Decoding error: {message}"),
            Self::GenerationError { message, .. } => {
                write!(f, "State generation error: {message}")
            }
            Self::ProcessingError { message, .. } => {
                write!(f, "Log processing error: {message}")
            }
            Self::OrderingError { message } => write!(f, "Log ordering error: {message}"),
            Self::CacheError { message, .. } => write!(f, "Cache error: {message}"),
            Self::SerializationError { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Self::DeliveryError { message, .. } => write!(f, "Delivery error: {message}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigError { source, .. }
            | Self::RpcError { source, .. }
            | Self::DecodingError { source, .. }
            | Self::GenerationError { source, .. }
            | Self::ProcessingError { source, .. }
            | Self::CacheError { source, .. }
            | Self::SerializationError { source, .. }
            | Self::DeliveryError { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &dyn std::error::Error),
            Self::OrderingError { .. } => None,
        }
    }
}

/// Convert from `eyre::Report` to `SyncError`.
///
/// Reports reaching this conversion come from provider plumbing, so they are
/// categorized as RPC errors.
impl From<eyre::Report> for SyncError {
    fn from(err: eyre::Report) -> Self {
        Self::RpcError {
            message: err.to_string(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

//! Error types for the I/O queue subsystem.

use thiserror::Error;

use crate::request::IoOpType;

/// Result type alias for I/O queue operations.
pub type IoQueueResult<T> = Result<T, IoQueueError>;

/// Error variants for I/O queue operations.
///
/// A priority class re-registered with different shares is not represented
/// here: that is a configuration bug and panics instead.
#[derive(Debug, Error)]
pub enum IoQueueError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Every priority class slot is taken.
    #[error("No more room for new I/O priority classes (max {max})")]
    ResourceExhausted {
        /// Capacity of the registry.
        max: usize,
    },

    /// Rename target is already owned by another priority class.
    #[error("rename priority class: an attempt was made to rename a priority class to an already existing name ({name})")]
    NameCollision {
        /// The requested name.
        name: String,
    },

    /// The priority class id was never handed out by the registry.
    #[error("Unknown priority class: {id}")]
    UnknownPriorityClass {
        /// The raw class id.
        id: u32,
    },

    /// Shares must be a positive weight.
    #[error("Invalid shares for priority class {name}: shares must be positive")]
    InvalidShares {
        /// The class being registered.
        name: String,
    },

    /// The request is neither a read nor a write and cannot be costed.
    #[error("Unrecognized request passing through I/O queue: {op}")]
    UnrecognizedRequestKind {
        /// The offending operation.
        op: IoOpType,
    },

    /// A metric with the same name and labels is already registered.
    #[error("Double registration of metric {name} {labels:?}")]
    DuplicateMetricRegistration {
        /// Fully qualified metric name.
        name: String,
        /// Label pairs of the metric.
        labels: Vec<(String, String)>,
    },

    /// The storage backend reported a failure for a dispatched request.
    #[error("Backend failure on device {device}: {reason}")]
    BackendFailure {
        /// Device id of the queue.
        device: u64,
        /// Description of the failure.
        reason: String,
    },

    /// The completion was dropped without being completed or failed.
    #[error("I/O request abandoned before completion")]
    RequestAbandoned,

    /// Invalid configuration.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },
}

//! Kernel error taxonomy
//!
//! Three families of failure, kept strictly apart:
//!
//! - [`TaskError`] is raised by (or thrown into) a single task and never
//!   escapes it except through join/result accessors.
//! - [`InvariantError`] means the kernel's own bookkeeping is corrupt; it
//!   aborts the current invocation and the driver must discard the state.
//! - [`SerializationError`] covers snapshot encode/decode failures; a failed
//!   restore must be treated as a cold start.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Classification of a task-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// Raised by task-body logic
    User,
    /// The task was canceled, directly or by cascade
    Canceled,
    /// An operation hit a destroyed semaphore
    SemaphoreDestroyed,
    /// An operation hit a closed channel
    ChannelClosed,
    /// A malformed request (unknown handle, negative amount, ...)
    Invalid,
    /// A missing external reference was dereferenced
    Unavailable,
    /// A frozen routine could not be rehydrated
    Serialization,
}

/// Error raised by or thrown into a single task
///
/// Carries a kind for programmatic matching, a human-readable message, an
/// optional propagation trace, and arbitrary structured fields so domain
/// errors survive a save/restore round trip intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    /// Failure classification
    pub kind: TaskErrorKind,
    /// Human-readable description
    pub message: String,
    /// Propagation breadcrumbs, oldest first
    pub trace: Vec<String>,
    /// Arbitrary structured payload attached by the raiser
    pub fields: BTreeMap<String, Value>,
}

impl TaskError {
    /// Create an error of the given kind
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    /// A task-body error
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::User, message)
    }

    /// The distinguished cancellation error
    pub fn canceled() -> Self {
        Self::new(TaskErrorKind::Canceled, "Task has been canceled")
    }

    /// A malformed request
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Invalid, message)
    }

    /// Attach a structured field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Push a propagation breadcrumb
    pub fn traced(mut self, context: impl Into<String>) -> Self {
        self.trace.push(context.into());
        self
    }

    /// Whether this error is a cancellation
    pub fn is_cancellation(&self) -> bool {
        self.kind == TaskErrorKind::Canceled
    }
}

/// Corrupt internal kernel state
///
/// Always fatal for the invocation; never retried, never confined to a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("internal invariant violated: {message}")]
pub struct InvariantError {
    /// What was found to be inconsistent
    pub message: String,
}

impl InvariantError {
    /// Record an invariant violation
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Snapshot encode/decode failure
///
/// Fatal for the load it occurs in; the driver must cold-start rather than
/// partially apply a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The blob does not start with the snapshot magic number
    #[error("invalid snapshot magic number")]
    InvalidMagic,

    /// The blob was written by an incompatible format version
    #[error("unsupported snapshot version (expected {expected}, got {actual})")]
    UnsupportedVersion {
        /// Version this kernel writes
        expected: u32,
        /// Version found in the blob
        actual: u32,
    },

    /// The payload checksum does not match
    #[error("snapshot checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch {
        /// Checksum recorded in the blob
        expected: String,
        /// Checksum of the payload as read
        actual: String,
    },

    /// The blob ends before the framed payload does
    #[error("truncated snapshot")]
    Truncated,

    /// Structurally invalid snapshot data
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    /// An encoded object names a type tag with no registered codec
    #[error("no codec registered for type tag {0:?}")]
    UnregisteredType(String),

    /// JSON payload encode/decode failure
    #[error("snapshot payload error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Umbrella error for driver-facing kernel entry points
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Corrupt kernel state
    #[error(transparent)]
    Invariant(#[from] InvariantError),

    /// Snapshot failure
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A process could not be started
    #[error("failed to start process: {0}")]
    Start(TaskError),
}

/// Check an internal invariant, returning an [`InvariantError`] on failure.
///
/// The error converts into the caller's error type via `From`, so this works
/// in any `Result` context that accepts `InvariantError`.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::InvariantError::new(format!($($arg)*)).into());
        }
    };
}

pub(crate) use invariant;

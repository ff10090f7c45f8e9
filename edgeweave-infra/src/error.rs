//! Reconciliation error types.

use std::time::Duration;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::state::StateError;

/// Errors that can occur while converging or tearing down infrastructure.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A pre-existing shared object could not be found by name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Listing a collection failed.
    #[error("listing failed: {0}")]
    Listing(String),

    /// Reading an existing object for comparison failed.
    #[error("reading failed: {0}")]
    Reading(String),

    /// Creating an object failed.
    #[error("creating failed: {0}")]
    Creating(String),

    /// Patching an object that drifted failed.
    #[error("updating failed: {0}")]
    Updating(String),

    /// Deleting an owned object failed.
    #[error("deleting failed: {0}")]
    Deleting(String),

    /// An upstream reference this task depends on is not in state.
    #[error("missing dependency: {0} reference is not set")]
    MissingDependency(&'static str),

    /// The allocated address did not show up in realized state in time.
    #[error("address for {path} not realized after {waited:?}")]
    RealizationTimeout { path: String, waited: Duration },

    /// The desired spec is unusable.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The run was cancelled before the next task started.
    #[error("cancelled")]
    Cancelled,

    /// Persisting the state document failed.
    #[error("state store: {0}")]
    State(String),

    /// A task failed; carries the task label.
    #[error("task {task} failed: {source}")]
    Task {
        task: &'static str,
        #[source]
        source: Box<ReconcileError>,
    },
}

impl ReconcileError {
    /// Attach a task label, unless one is already attached.
    pub fn in_task(self, task: &'static str) -> Self {
        match self {
            e @ ReconcileError::Task { .. } => e,
            e => ReconcileError::Task {
                task,
                source: Box::new(e),
            },
        }
    }

    /// The error without any task label.
    pub fn root(&self) -> &ReconcileError {
        match self {
            ReconcileError::Task { source, .. } => source.root(),
            e => e,
        }
    }

    /// No retry can fix these; an operator has to act.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            ReconcileError::NotFound(_)
                | ReconcileError::MissingDependency(_)
                | ReconcileError::InvalidSpec(_)
        )
    }

    /// Transient failures the caller's outer loop should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            ReconcileError::Listing(_)
                | ReconcileError::Reading(_)
                | ReconcileError::Creating(_)
                | ReconcileError::Updating(_)
                | ReconcileError::Deleting(_)
                | ReconcileError::RealizationTimeout { .. }
                | ReconcileError::State(_)
        )
    }

    pub(crate) fn listing(err: CatalogError) -> Self {
        ReconcileError::Listing(err.message())
    }

    pub(crate) fn reading(err: CatalogError) -> Self {
        ReconcileError::Reading(err.message())
    }

    pub(crate) fn creating(err: CatalogError) -> Self {
        ReconcileError::Creating(err.message())
    }

    pub(crate) fn updating(err: CatalogError) -> Self {
        ReconcileError::Updating(err.message())
    }

    pub(crate) fn deleting(err: CatalogError) -> Self {
        ReconcileError::Deleting(err.message())
    }
}

impl From<StateError> for ReconcileError {
    fn from(err: StateError) -> Self {
        ReconcileError::State(err.to_string())
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

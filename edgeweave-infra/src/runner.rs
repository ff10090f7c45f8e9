//! Ordered execution of the task pipeline.
//!
//! Tasks run strictly one after another; each reads references produced by
//! its predecessors. The state document is saved after every task that
//! changed it, so a crash loses at most one task's progress. Cancellation is
//! only observed between tasks.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ReconcileError, Result};
use crate::recovery::{recover_all, recover_task};
use crate::spec::InfraSpec;
use crate::state::{InfraState, StateStore};
use crate::task::{EnsurerContext, Outcome, Task, standard_tasks};

/// Result of one task within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub task: &'static str,
    pub outcome: Outcome,
}

/// Per-task outcomes of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: Vec<StepReport>,
    /// References spliced back in by inline recovery.
    pub recovered: usize,
}

impl RunSummary {
    /// Whether anything changed, remotely or in state.
    pub fn changed(&self) -> bool {
        self.recovered > 0 || self.steps.iter().any(|s| s.outcome.is_change())
    }

    pub fn outcome_of(&self, task: &str) -> Option<Outcome> {
        self.steps
            .iter()
            .find(|s| s.task == task)
            .map(|s| s.outcome)
    }

    fn push(&mut self, task: &'static str, outcome: Outcome) {
        self.steps.push(StepReport { task, outcome });
    }
}

/// Drives a fixed list of tasks.
pub struct TaskRunner {
    tasks: Vec<Box<dyn Task>>,
    recovery: bool,
}

impl TaskRunner {
    pub fn new(tasks: Vec<Box<dyn Task>>) -> Self {
        Self {
            tasks,
            recovery: true,
        }
    }

    /// The full infrastructure pipeline with inline recovery enabled.
    pub fn standard() -> Self {
        Self::new(standard_tasks())
    }

    /// Skip the recovery listing before each task.
    pub fn without_recovery(mut self) -> Self {
        self.recovery = false;
        self
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    /// Ensure every task in order, stopping at the first failure.
    ///
    /// On failure the state reflects the last successfully completed task.
    pub async fn ensure_all(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
        store: &dyn StateStore,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for task in &self.tasks {
            let label = task.label();
            check_cancelled(cancel, label)?;

            if self.recovery
                && task.reference(state).is_none()
                && let Some(recoverable) = task.recoverable()
            {
                let recovered = recover_task(ctx, spec, state, recoverable)
                    .await
                    .map_err(|e| fail(label, e))?;
                if recovered {
                    summary.recovered += 1;
                    persist(store, state).await?;
                }
            }

            let outcome = task
                .ensure(ctx, spec, state)
                .await
                .map_err(|e| fail(label, e))?;
            log_outcome(task.as_ref(), spec, state, outcome);
            if outcome.is_change() {
                persist(store, state).await?;
            }
            summary.push(label, outcome);
        }
        Ok(summary)
    }

    /// Delete every owned object in reverse order, then release the shared
    /// references. Tasks with nothing referenced are skipped.
    pub async fn ensure_deleted_all(
        &self,
        ctx: &EnsurerContext,
        state: &mut InfraState,
        store: &dyn StateStore,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for task in self.tasks.iter().rev() {
            let Some(deletable) = task.deletable() else {
                continue;
            };
            let label = task.label();
            check_cancelled(cancel, label)?;

            let had_reference = task.reference(state).is_some();
            let deleted = deletable
                .ensure_deleted(ctx, state)
                .await
                .map_err(|e| fail(label, e))?;
            let outcome = if deleted {
                info!(task = label, "Deleted");
                Outcome::Deleted
            } else {
                debug!(task = label, "Nothing to delete");
                Outcome::Unchanged
            };
            if had_reference {
                persist(store, state).await?;
            }
            summary.push(label, outcome);
        }

        state.release_shared();
        persist(store, state).await?;
        Ok(summary)
    }

    /// Standalone recovery pass over every task, saving if anything was
    /// found.
    pub async fn recover(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
        store: &dyn StateStore,
    ) -> Result<usize> {
        let recovered = recover_all(ctx, spec, state, &self.tasks).await?;
        if recovered > 0 {
            persist(store, state).await?;
        }
        Ok(recovered)
    }
}

fn check_cancelled(cancel: &watch::Receiver<bool>, next: &'static str) -> Result<()> {
    if *cancel.borrow() {
        warn!(next_task = next, "Run cancelled");
        return Err(ReconcileError::Cancelled);
    }
    Ok(())
}

fn fail(label: &'static str, err: ReconcileError) -> ReconcileError {
    error!(task = label, error = %err, fatal = err.is_fatal(), "Task failed");
    err.in_task(label)
}

async fn persist(store: &dyn StateStore, state: &mut InfraState) -> Result<()> {
    state.touch();
    store.save(state).await?;
    Ok(())
}

fn log_outcome(task: &dyn Task, spec: &InfraSpec, state: &InfraState, outcome: Outcome) {
    let id = task.reference(state).map(|r| r.id).unwrap_or_default();
    let name = task.name_to_log(spec).unwrap_or_default();
    match outcome {
        Outcome::Unchanged => {
            debug!(task = task.label(), object = name, id = %id, outcome = %outcome, "Task done")
        }
        _ => info!(task = task.label(), object = name, id = %id, outcome = %outcome, "Task done"),
    }
}

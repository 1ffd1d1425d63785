//! Runs one instance through its definition's runner.
//!
//! Shared by both lifecycles. The runner executes on its own tokio task so a panic in a
//! task body is contained and reported as a `RunnerError` like any other failure.

use std::time::Duration;

use tracing::warn;

use crate::domain::{ConcreteTaskInstance, RunResult, RunnerError};
use crate::typed::TaskDefinition;

/// Create the runner and race it against `timeout`.
///
/// On timeout the runner's task is aborted and the run counts as failed.
pub(crate) async fn execute(
    definition: &TaskDefinition,
    instance: ConcreteTaskInstance,
    timeout: Duration,
) -> Result<RunResult, RunnerError> {
    let id = instance.id.clone();
    let runner = definition.factory.create_task_runner(instance)?;
    let mut handle = tokio::spawn(runner.run());

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            warn!(task_id = %id, "task runner panicked");
            Err(RunnerError::new(format!(
                "task \"{}\" panicked",
                definition.task_type
            )))
        }
        Ok(Err(join_err)) => Err(RunnerError::new(format!("task was cancelled: {join_err}"))),
        Err(_) => {
            handle.abort();
            warn!(task_id = %id, timeout = ?timeout, "task runner timed out");
            Err(RunnerError::new(format!(
                "task \"{}\" timed out after {timeout:?}",
                definition.task_type
            )))
        }
    }
}

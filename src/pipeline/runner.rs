use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::Level;

use crate::error::{PipelineError, RuntimeError};
use crate::pipeline::{Pipeline, TaskNode};

/// Runs the work behind a single task node.
///
/// Implemented for any `Fn(&TaskNode) -> Result<(), RuntimeError>`, so a closure
/// dispatching on [`TaskNode::kind`](crate::pipeline::TaskNode) is enough.
pub trait TaskExecutor {
    fn execute(&self, task: &TaskNode) -> Result<(), RuntimeError>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&TaskNode) -> Result<(), RuntimeError>,
{
    fn execute(&self, task: &TaskNode) -> Result<(), RuntimeError> {
        self(task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Complete,
    Errored(String),
    /// Not run because the named parent did not complete.
    Skipped { parent: String },
}

impl TaskStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskStatus::Complete)
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// Task name and final status, in execution order.
    pub statuses: Vec<(String, TaskStatus)>,
    pub execution_times: HashMap<String, Duration>,
}

impl RunReport {
    pub fn status(&self, name: &str) -> Option<&TaskStatus> {
        self.statuses
            .iter()
            .find(|(task, _)| task == name)
            .map(|(_, status)| status)
    }

    pub fn is_success(&self) -> bool {
        self.statuses.iter().all(|(_, status)| status.is_complete())
    }

    pub fn count(&self, predicate: impl Fn(&TaskStatus) -> bool) -> usize {
        self.statuses.iter().filter(|(_, s)| predicate(s)).count()
    }
}

impl Pipeline {
    /// Execute every task once, parents first.
    ///
    /// A failing task does not stop the run: its descendants are marked as
    /// skipped and unrelated branches carry on. Panics inside the executor are
    /// caught and reported as errors.
    pub fn run(&self, executor: &dyn TaskExecutor) -> Result<RunReport, PipelineError> {
        let order = self.execution_order()?;
        let mut report = RunReport::default();
        let mut outcome: HashMap<&str, bool> = HashMap::with_capacity(order.len());

        let root_span = tracing::span!(Level::INFO, "pipeline", session = %self.session_path());
        let _enter = root_span.enter();

        for task in order {
            let blocked = task
                .parents
                .iter()
                .find(|parent| !outcome.get(parent.as_str()).copied().unwrap_or(false));

            if let Some(parent) = blocked {
                tracing::warn!("skipping {}: parent {} did not complete", task.name, parent);
                outcome.insert(&task.name, false);
                report.statuses.push((
                    task.name.clone(),
                    TaskStatus::Skipped {
                        parent: parent.clone(),
                    },
                ));
                continue;
            }

            let span = tracing::span!(Level::INFO, "task", name = %task.name, kind = %task.kind);
            let _enter = span.enter();

            let start = Instant::now();
            let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                executor.execute(task)
            })) {
                Ok(result) => result,
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("Task panicked: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("Task panicked: {s}")
                    } else {
                        String::from("Task panicked with unknown payload")
                    };

                    Err(anyhow::anyhow!(msg))
                }
            };
            report
                .execution_times
                .insert(task.name.clone(), start.elapsed());

            let status = match result {
                Ok(()) => {
                    tracing::info!("{} complete", task.name);
                    TaskStatus::Complete
                }
                Err(err) => {
                    tracing::error!("{} failed: {:#}", task.name, err);
                    TaskStatus::Errored(format!("{err:#}"))
                }
            };

            outcome.insert(&task.name, status.is_complete());
            report.statuses.push((task.name.clone(), status));
        }

        Ok(report)
    }
}

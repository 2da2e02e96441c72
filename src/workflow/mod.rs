//! Sequential task workflows with bounded per-task retry
//!
//! A workflow is an ordered list of named tasks run against one shared
//! context. Each task either runs a single async step or a nested sequence of
//! sub-tasks. Tasks marked retryable get up to [`MAX_ATTEMPTS`] tries; the
//! first hard failure aborts the workflow and surfaces the failing task's
//! name. Data produced by one task reaches the next through the typed
//! [`Artifact`] rather than a dynamic bag.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts granted to a retryable task
pub const MAX_ATTEMPTS: usize = 3;

/// Typed payload threaded from task to task
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    /// Join command fetched from a host-cluster master, consumed by the
    /// rejoin-to-host sub-step during unjoin
    pub host_join_command: Option<String>,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TaskError(#[from] pub anyhow::Error);

impl TaskError {
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError(anyhow::anyhow!(message.into()))
    }
}

#[derive(Debug, Error)]
#[error("task '{task}' failed after {attempts} attempt(s): {source}")]
pub struct WorkflowError {
    pub task: String,
    pub attempts: usize,
    #[source]
    pub source: TaskError,
}

pub type TaskResult = Result<Artifact, TaskError>;

/// Boxed async step; takes the shared context and the artifact from the
/// previous task
pub type TaskFn<C> = Arc<dyn Fn(Arc<C>, Artifact) -> BoxFuture<'static, TaskResult> + Send + Sync>;

pub enum TaskAction<C> {
    Run(TaskFn<C>),
    Sequence(Vec<Task<C>>),
}

pub struct Task<C> {
    pub name: String,
    pub retryable: bool,
    pub action: TaskAction<C>,
}

impl<C: Send + Sync + 'static> Task<C> {
    /// Single-step task from an async closure
    pub fn step<F, Fut>(name: impl Into<String>, retryable: bool, f: F) -> Self
    where
        F: Fn(Arc<C>, Artifact) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            retryable,
            action: TaskAction::Run(Arc::new(move |ctx, artifact| Box::pin(f(ctx, artifact)))),
        }
    }

    /// Task whose body is an ordered sequence of sub-tasks
    pub fn sequence(name: impl Into<String>, retryable: bool, tasks: Vec<Task<C>>) -> Self {
        Self {
            name: name.into(),
            retryable,
            action: TaskAction::Sequence(tasks),
        }
    }
}

/// Runs an ordered task list to completion or first hard failure
pub struct Workflow<C> {
    name: String,
    tasks: Vec<Task<C>>,
}

impl<C: Send + Sync + 'static> Workflow<C> {
    pub fn new(name: impl Into<String>, tasks: Vec<Task<C>>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    pub async fn run(&self, ctx: Arc<C>) -> Result<(), WorkflowError> {
        let mut artifact = Artifact::default();
        for task in &self.tasks {
            artifact = run_task(&self.name, task, ctx.clone(), artifact).await?;
        }
        Ok(())
    }
}

fn run_task<'a, C: Send + Sync + 'static>(
    workflow: &'a str,
    task: &'a Task<C>,
    ctx: Arc<C>,
    input: Artifact,
) -> BoxFuture<'a, Result<Artifact, WorkflowError>> {
    Box::pin(async move {
        let budget = if task.retryable { MAX_ATTEMPTS } else { 1 };
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "workflow {}: task '{}' attempt {}/{}",
                workflow, task.name, attempt, budget
            );

            let result = match &task.action {
                TaskAction::Run(f) => f(ctx.clone(), input.clone()).await,
                TaskAction::Sequence(tasks) => {
                    run_sequence(workflow, tasks, ctx.clone(), input.clone()).await
                }
            };

            match result {
                Ok(artifact) => return Ok(artifact),
                Err(source) if attempt >= budget => {
                    return Err(WorkflowError {
                        task: task.name.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(source) => {
                    warn!(
                        "workflow {}: task '{}' attempt {} failed, retrying: {}",
                        workflow, task.name, attempt, source
                    );
                }
            }
        }
    })
}

async fn run_sequence<C: Send + Sync + 'static>(
    workflow: &str,
    tasks: &[Task<C>],
    ctx: Arc<C>,
    input: Artifact,
) -> TaskResult {
    let mut artifact = input;
    for task in tasks {
        artifact = run_task(workflow, task, ctx.clone(), artifact)
            .await
            .map_err(|e| TaskError(anyhow::Error::new(e)))?;
    }
    Ok(artifact)
}

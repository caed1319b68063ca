//! Job subsystem contract
//!
//! Long running, cancellable operations (such as a reconnection attempt) are
//! handed to a [`JobManager`] which runs them, tracks them and reports how they
//! ended. Providers only depend on this trait; `herald-scheduler` supplies the
//! runtime implementation.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// The body of a job. Receives the job's own cancellation token.
pub type JobWork = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Box a closure into [`JobWork`]
pub fn job_work<F, Fut>(f: F) -> JobWork
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |token| -> BoxFuture<'static, Result<()>> { Box::pin(f(token)) })
}

/// Describes a job before it is registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub description: String,
    /// At most one job per scope may be active at a time
    pub scope: String,
}

impl JobDescriptor {
    pub fn new(description: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            scope: scope.into(),
        }
    }
}

/// Handle to a registered job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub descriptor: JobDescriptor,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    /// The job, or the wait on it, was cancelled
    Cancelled,
    /// The job returned an error or panicked
    Faulted(String),
}

#[async_trait]
pub trait JobManager: Send + Sync {
    /// Start `work` as a new job. Cancelling `token` cancels the job.
    async fn register_operation(
        &self,
        descriptor: JobDescriptor,
        work: JobWork,
        token: CancellationToken,
    ) -> Result<Job>;

    /// Wait until `job` ends. Returns [`JobOutcome::Cancelled`] early if `token` fires.
    async fn wait_for_job_completion(&self, job: &Job, token: &CancellationToken) -> Result<JobOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_work_boxes_closure() {
        let work = job_work(|token| async move {
            assert!(!token.is_cancelled());
            Ok(())
        });
        work(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_job_work_propagates_error() {
        let work = job_work(|_| async { Err(anyhow::anyhow!("refused")) });
        let err = work(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "refused");
    }

    #[test]
    fn test_descriptor_new() {
        let descriptor = JobDescriptor::new("Reconnect ops bot", "chat:ops");
        assert_eq!(descriptor.scope, "chat:ops");
    }
}

//! Tokio task runner for jobs
//!
//! This module manages the lifecycle of job tasks, spawning each registered
//! operation as a tokio task under its own cancellation token and recording
//! how it ended.

use crate::job::JobRecord;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use herald_core::error::ChatError;
use herald_core::jobs::{Job, JobDescriptor, JobManager, JobOutcome, JobWork};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the job runner
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of concurrently running jobs
    pub max_concurrent_jobs: usize,

    /// Number of finished job records kept for inspection
    pub max_history: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 100,
            max_history: 200,
        }
    }
}

struct ActiveJob {
    token: CancellationToken,
    done: watch::Receiver<Option<JobOutcome>>,
}

/// Runs and tracks jobs
pub struct JobRunner {
    /// Configuration
    config: JobRunnerConfig,

    /// Every known job, running or finished (job_id -> record)
    records: Arc<DashMap<String, JobRecord>>,

    /// Running jobs (job_id -> token and completion signal)
    active: Arc<DashMap<String, ActiveJob>>,

    /// Busy scopes (scope -> job_id)
    scopes: Arc<DashMap<String, String>>,
}

impl JobRunner {
    /// Create a new job runner
    pub fn new() -> Self {
        Self::with_config(JobRunnerConfig::default())
    }

    /// Create a new job runner with custom configuration
    pub fn with_config(config: JobRunnerConfig) -> Self {
        Self {
            config,
            records: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            scopes: Arc::new(DashMap::new()),
        }
    }

    /// Cancel a specific job
    pub fn cancel_job(&self, id: &str) -> bool {
        if let Some(job) = self.active.get(id) {
            info!("Cancelling job: {}", id);
            job.token.cancel();
            true
        } else {
            warn!("Attempted to cancel non-running job: {}", id);
            false
        }
    }

    /// Cancel all running jobs
    pub fn shutdown(&self) {
        info!("Cancelling all jobs");
        for entry in self.active.iter() {
            debug!("Cancelling job: {}", entry.key());
            entry.value().token.cancel();
        }
    }

    /// Get the number of running jobs
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Look up a job record
    pub fn record(&self, id: &str) -> Option<JobRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All job records, newest first
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    /// Drop the oldest finished records beyond the history limit
    fn prune_history(records: &DashMap<String, JobRecord>, max_history: usize) {
        let mut finished: Vec<(String, chrono::DateTime<chrono::Utc>)> = records
            .iter()
            .filter(|r| !r.is_running())
            .map(|r| (r.id.clone(), r.started_at))
            .collect();
        if finished.len() <= max_history {
            return;
        }
        finished.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = finished.len() - max_history;
        for (id, _) in finished.into_iter().take(excess) {
            records.remove(&id);
        }
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify how a job body ended
fn classify(result: std::result::Result<Result<()>, tokio::task::JoinError>, token: &CancellationToken) -> JobOutcome {
    match result {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(e)) => {
            let cancelled = token.is_cancelled()
                || e.downcast_ref::<ChatError>().is_some_and(ChatError::is_cancelled);
            if cancelled {
                JobOutcome::Cancelled
            } else {
                JobOutcome::Faulted(format!("{:#}", e))
            }
        }
        Err(join_err) if join_err.is_cancelled() => JobOutcome::Cancelled,
        Err(join_err) => JobOutcome::Faulted(format!("job panicked: {}", join_err)),
    }
}

#[async_trait]
impl JobManager for JobRunner {
    async fn register_operation(
        &self,
        descriptor: JobDescriptor,
        work: JobWork,
        token: CancellationToken,
    ) -> Result<Job> {
        // Check if we've reached max concurrent jobs
        if self.active.len() >= self.config.max_concurrent_jobs {
            anyhow::bail!(
                "Maximum concurrent jobs reached: {}",
                self.config.max_concurrent_jobs
            );
        }

        let record = JobRecord::new(&descriptor);
        let id = record.id.clone();

        // Claim the scope
        match self.scopes.entry(descriptor.scope.clone()) {
            Entry::Occupied(existing) => {
                anyhow::bail!(
                    "Scope '{}' already has an active job: {}",
                    descriptor.scope,
                    existing.get()
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        info!("Starting job: {} ({})", id, record.summary());

        let job_token = token.child_token();
        let (done_tx, done_rx) = watch::channel(None);
        self.records.insert(id.clone(), record);
        self.active.insert(
            id.clone(),
            ActiveJob {
                token: job_token.clone(),
                done: done_rx,
            },
        );

        let records = self.records.clone();
        let active = self.active.clone();
        let scopes = self.scopes.clone();
        let max_history = self.config.max_history;
        let scope = descriptor.scope.clone();
        let job_id = id.clone();

        tokio::spawn(async move {
            // Run the body in its own task so a panic is reported instead of lost
            let result = tokio::spawn(work(job_token.clone())).await;
            let outcome = classify(result, &job_token);

            match &outcome {
                JobOutcome::Completed => debug!("Job {} completed", job_id),
                JobOutcome::Cancelled => debug!("Job {} cancelled", job_id),
                JobOutcome::Faulted(message) => warn!("Job {} faulted: {}", job_id, message),
            }

            if let Some(mut record) = records.get_mut(&job_id) {
                record.finish(&outcome);
            }
            // Free the scope before waking waiters so they can start a successor
            active.remove(&job_id);
            scopes.remove_if(&scope, |_, owner| owner == &job_id);
            let _ = done_tx.send(Some(outcome));
            Self::prune_history(&records, max_history);
        });

        Ok(Job { id, descriptor })
    }

    async fn wait_for_job_completion(&self, job: &Job, token: &CancellationToken) -> Result<JobOutcome> {
        let done = self.active.get(&job.id).map(|j| j.done.clone());

        let Some(mut done) = done else {
            // Already finished
            return self
                .records
                .get(&job.id)
                .and_then(|r| r.outcome())
                .ok_or_else(|| anyhow!("Unknown job: {}", job.id));
        };

        tokio::select! {
            _ = token.cancelled() => Ok(JobOutcome::Cancelled),
            result = done.wait_for(Option::is_some) => match result {
                Ok(outcome) => Ok(outcome.clone().unwrap_or(JobOutcome::Cancelled)),
                Err(_) => self
                    .records
                    .get(&job.id)
                    .and_then(|r| r.outcome())
                    .ok_or_else(|| anyhow!("Job {} ended without reporting", job.id)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use herald_core::jobs::job_work;
    use std::time::Duration;

    fn descriptor(scope: &str) -> JobDescriptor {
        JobDescriptor::new(format!("Test job in {}", scope), scope)
    }

    #[tokio::test]
    async fn test_job_completes() {
        let runner = JobRunner::new();
        let job = runner
            .register_operation(descriptor("a"), job_work(|_| async { Ok(()) }), CancellationToken::new())
            .await
            .unwrap();

        let outcome = runner
            .wait_for_job_completion(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(runner.record(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_job_fault_is_reported() {
        let runner = JobRunner::new();
        let job = runner
            .register_operation(
                descriptor("a"),
                job_work(|_| async { Err(anyhow!("connection refused")) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let outcome = runner
            .wait_for_job_completion(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Faulted(ref m) if m.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_job_panic_is_reported() {
        let runner = JobRunner::new();
        let job = runner
            .register_operation(
                descriptor("a"),
                job_work(|_| async { panic!("boom") }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let outcome = runner
            .wait_for_job_completion(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Faulted(_)));
    }

    #[tokio::test]
    async fn test_cancelling_parent_token_cancels_job() {
        let runner = JobRunner::new();
        let parent = CancellationToken::new();
        let job = runner
            .register_operation(
                descriptor("a"),
                job_work(|token| async move {
                    token.cancelled().await;
                    Err(anyhow::Error::from(ChatError::Cancelled))
                }),
                parent.clone(),
            )
            .await
            .unwrap();

        parent.cancel();
        let outcome = runner
            .wait_for_job_completion(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_scope_allows_one_active_job() {
        let runner = JobRunner::new();
        let release = CancellationToken::new();
        let gate = release.clone();
        let first = runner
            .register_operation(
                descriptor("chat:ops"),
                job_work(move |_| async move {
                    gate.cancelled().await;
                    Ok(())
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let second = runner
            .register_operation(descriptor("chat:ops"), job_work(|_| async { Ok(()) }), CancellationToken::new())
            .await;
        assert!(second.is_err());

        // A different scope is unaffected
        runner
            .register_operation(descriptor("chat:other"), job_work(|_| async { Ok(()) }), CancellationToken::new())
            .await
            .unwrap();

        release.cancel();
        runner
            .wait_for_job_completion(&first, &CancellationToken::new())
            .await
            .unwrap();

        // Scope is free again once the first job finished
        let third = runner
            .register_operation(descriptor("chat:ops"), job_work(|_| async { Ok(()) }), CancellationToken::new())
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_wait_cancelled_returns_early() {
        let runner = JobRunner::new();
        let job = runner
            .register_operation(
                descriptor("a"),
                job_work(|token| async move {
                    token.cancelled().await;
                    Ok(())
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let wait_token = CancellationToken::new();
        wait_token.cancel();
        let outcome = runner.wait_for_job_completion(&job, &wait_token).await.unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert_eq!(runner.active_count(), 1);

        assert!(runner.cancel_job(&job.id));
        let outcome = runner
            .wait_for_job_completion(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all() {
        let runner = JobRunner::new();
        let mut jobs = Vec::new();
        for scope in ["a", "b", "c"] {
            jobs.push(
                runner
                    .register_operation(
                        descriptor(scope),
                        job_work(|token| async move {
                            token.cancelled().await;
                            Err(anyhow::Error::from(ChatError::Cancelled))
                        }),
                        CancellationToken::new(),
                    )
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(runner.active_count(), 3);

        runner.shutdown();
        for job in &jobs {
            let outcome = runner
                .wait_for_job_completion(job, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome, JobOutcome::Cancelled);
        }

        // Bookkeeping is removed right after the outcome is published
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.active_count(), 0);
        assert_eq!(runner.list().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let runner = JobRunner::new();
        let job = Job {
            id: "missing".to_string(),
            descriptor: descriptor("a"),
        };
        assert!(
            runner
                .wait_for_job_completion(&job, &CancellationToken::new())
                .await
                .is_err()
        );
        assert!(!runner.cancel_job("missing"));
    }

    #[tokio::test]
    async fn test_history_is_pruned() {
        let runner = JobRunner::with_config(JobRunnerConfig {
            max_concurrent_jobs: 10,
            max_history: 2,
        });
        for i in 0..5 {
            let job = runner
                .register_operation(
                    descriptor(&format!("scope-{}", i)),
                    job_work(|_| async { Ok(()) }),
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            runner
                .wait_for_job_completion(&job, &CancellationToken::new())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(runner.list().len() <= 2);
    }
}

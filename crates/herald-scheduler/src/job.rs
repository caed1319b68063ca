//! Job records
//!
//! Every operation registered with the runner leaves a record behind that
//! describes what it was and how it ended.

use chrono::{DateTime, Utc};
use herald_core::jobs::{JobDescriptor, JobOutcome};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
    Faulted,
}

/// Bookkeeping for a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier for this job
    pub id: String,

    /// What the job does
    pub description: String,

    /// Cancellation scope; only one job per scope runs at a time
    pub scope: String,

    pub status: JobStatus,

    /// Failure message for faulted jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a running record with a generated UUID
    pub fn new(descriptor: &JobDescriptor) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: descriptor.description.clone(),
            scope: descriptor.scope.clone(),
            status: JobStatus::Running,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Mark the record finished with the given outcome
    pub fn finish(&mut self, outcome: &JobOutcome) {
        self.finished_at = Some(Utc::now());
        match outcome {
            JobOutcome::Completed => self.status = JobStatus::Completed,
            JobOutcome::Cancelled => self.status = JobStatus::Cancelled,
            JobOutcome::Faulted(message) => {
                self.status = JobStatus::Faulted;
                self.error = Some(message.clone());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// The outcome of a finished job, `None` while it is still running
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.status {
            JobStatus::Running => None,
            JobStatus::Completed => Some(JobOutcome::Completed),
            JobStatus::Cancelled => Some(JobOutcome::Cancelled),
            JobStatus::Faulted => Some(JobOutcome::Faulted(
                self.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }

    /// Get a human-readable description of this job
    pub fn summary(&self) -> String {
        let mut desc = format!("{} [{}] ({:?})", self.description, self.scope, self.status);
        if let Some(err) = &self.error {
            desc.push_str(&format!(": {}", err));
        }
        desc
    }
}

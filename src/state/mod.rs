//! Job state persistence
//!
//! The store holds read-only snapshots published as jobs progress and
//! finish. The live `ContextLog` is owned by the job's orchestrator task;
//! nothing here mutates it.

use crate::error::OrchestrationError;
use crate::models::{ContextLog, JobState, JobStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn put_job(&self, state: JobState) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<JobState>;

    /// Replace the published snapshot of a job's context log.
    async fn put_log(&self, job_id: Uuid, log: ContextLog) -> Result<()>;

    async fn get_log(&self, job_id: Uuid) -> Result<ContextLog>;

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    async fn list_jobs(&self) -> Result<Vec<JobState>>;
}

/// In-memory store backed by `RwLock<HashMap>`.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    jobs: Arc<RwLock<HashMap<Uuid, JobState>>>,
    logs: Arc<RwLock<HashMap<Uuid, ContextLog>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn put_job(&self, state: JobState) -> Result<()> {
        self.jobs.write().await.insert(state.job_id, state);
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobState> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(OrchestrationError::JobNotFound(job_id))
    }

    async fn put_log(&self, job_id: Uuid, log: ContextLog) -> Result<()> {
        self.logs.write().await.insert(job_id, log);
        Ok(())
    }

    async fn get_log(&self, job_id: Uuid) -> Result<ContextLog> {
        self.logs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(OrchestrationError::JobNotFound(job_id))
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let state = jobs
            .get_mut(&job_id)
            .ok_or(OrchestrationError::JobNotFound(job_id))?;
        state.status = status;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobState>> {
        let mut jobs: Vec<JobState> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

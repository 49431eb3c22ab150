use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{Job, JobState, ProcessingProfile, TaskResult};
use super::jobs::{JobFilter, JobStore, WriteAck};

#[derive(Default)]
struct Collections {
    jobs: HashMap<String, Job>,
    results: HashMap<String, TaskResult>,
    profiles: BTreeMap<String, ProcessingProfile>,
}

/// In-process job store, used by standalone runs and tests
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Collections>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a job by id
    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    /// Number of stored results
    pub async fn result_count(&self) -> usize {
        self.inner.lock().await.results.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn read_pending_jobs(&self, batch_size: usize, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;

        let mut pending: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Ready && filter.allows(&job.host))
            .collect();

        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(pending.into_iter().take(batch_size).cloned().collect())
    }

    async fn update_job_state(&self, job_id: &str, state: JobState) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.state = state;
                job.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("Job not found: {}", job_id),
        }
    }

    async fn requeue_loaded_jobs(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut requeued = 0;

        for job in inner.jobs.values_mut().filter(|job| job.state == JobState::Loaded) {
            job.state = JobState::Ready;
            job.updated_at = Utc::now();
            requeued += 1;
        }

        Ok(requeued)
    }

    async fn write_result(&self, result: &TaskResult, ack: WriteAck) -> Result<()> {
        if ack == WriteAck::Unacknowledged {
            warn!("Unacknowledged write requested for task {}", result.task_id);
        }

        self.inner
            .lock()
            .await
            .results
            .insert(result.task_id.clone(), result.clone());

        debug!("Stored result for task: {}", result.task_id);
        Ok(())
    }

    async fn read_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        Ok(self.inner.lock().await.results.get(task_id).cloned())
    }

    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>> {
        let inner = self.inner.lock().await;
        let mut counts = BTreeMap::new();

        for job in inner.jobs.values() {
            *counts.entry(job.state).or_insert(0) += 1;
        }

        Ok(counts)
    }

    async fn submit_job(&self, job: &Job, _ack: WriteAck) -> Result<()> {
        self.inner.lock().await.jobs.insert(job.id.clone(), job.clone());
        debug!("Stored job: {}", job.id);
        Ok(())
    }

    async fn save_profile(&self, profile: &ProcessingProfile) -> Result<()> {
        self.inner
            .lock()
            .await
            .profiles
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<ProcessingProfile>> {
        Ok(self.inner.lock().await.profiles.values().cloned().collect())
    }

    async fn latest_job_for_profile(&self, profile_id: &str) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .jobs
            .values()
            .filter(|job| job.profile_id.as_deref() == Some(profile_id))
            .max_by_key(|job| job.created_at)
            .cloned())
    }
}

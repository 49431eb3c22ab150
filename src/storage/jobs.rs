use anyhow::Result;
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cli::config::StoreSettings;
use crate::domain::{Job, JobState, ProcessingProfile, TaskResult};
use super::memory::MemoryJobStore;
use super::mongo::MongoJobStore;

/// Durability requested for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteAck {
    Unacknowledged,
    Acknowledged,
    Majority,
}

/// Restricts which pending jobs are returned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Jobs whose host is listed here are skipped
    pub excluded_hosts: Vec<String>,
}

impl JobFilter {
    pub fn excluding(hosts: impl IntoIterator<Item = String>) -> Self {
        Self { excluded_hosts: hosts.into_iter().collect() }
    }

    pub fn allows(&self, host: &str) -> bool {
        !self.excluded_hosts.iter().any(|excluded| excluded.eq_ignore_ascii_case(host))
    }
}

/// Trait for persistent job storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Read up to `batch_size` READY jobs, highest priority and oldest first
    async fn read_pending_jobs(&self, batch_size: usize, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Set the state of a job
    async fn update_job_state(&self, job_id: &str, state: JobState) -> Result<()>;

    /// Return LOADED jobs to READY; used at startup since loaded tasks were held in memory
    async fn requeue_loaded_jobs(&self) -> Result<u64>;

    /// Store a task result, replacing any previous result of the same task
    async fn write_result(&self, result: &TaskResult, ack: WriteAck) -> Result<()>;

    /// Get a task result by task id
    async fn read_result(&self, task_id: &str) -> Result<Option<TaskResult>>;

    /// Number of jobs per state
    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>>;

    /// Store a new job
    async fn submit_job(&self, job: &Job, ack: WriteAck) -> Result<()>;

    /// Store a processing profile
    async fn save_profile(&self, profile: &ProcessingProfile) -> Result<()>;

    /// List all processing profiles
    async fn list_profiles(&self) -> Result<Vec<ProcessingProfile>>;

    /// Most recently created job of a profile
    async fn latest_job_for_profile(&self, profile_id: &str) -> Result<Option<Job>>;
}

/// Factory for creating a JobStore implementation
pub struct JobStoreFactory;

impl JobStoreFactory {
    /// Create a new JobStore instance based on the settings
    pub async fn create(settings: &StoreSettings) -> Result<Arc<dyn JobStore>> {
        match settings.storage_type.as_str() {
            "mongodb" => {
                let store = MongoJobStore::new(settings).await?;
                Ok(Arc::new(store))
            },
            "memory" => Ok(Arc::new(MemoryJobStore::new())),
            _ => {
                anyhow::bail!("Unsupported job store type: {}", settings.storage_type);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_is_case_insensitive() {
        let filter = JobFilter::excluding(vec!["Busy.org".to_string()]);
        assert!(!filter.allows("busy.org"));
        assert!(filter.allows("idle.org"));
        assert!(JobFilter::default().allows("busy.org"));
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_type() {
        let settings = StoreSettings { storage_type: "cassandra".to_string(), ..StoreSettings::default() };
        assert!(JobStoreFactory::create(&settings).await.is_err());

        let settings = StoreSettings { storage_type: "memory".to_string(), ..StoreSettings::default() };
        let store = JobStoreFactory::create(&settings).await.unwrap();
        assert!(store.count_by_state().await.unwrap().is_empty());
    }
}

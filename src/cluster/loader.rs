use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cli::config::{CoordinatorSettings, HostExceptionSettings};
use crate::domain::{JobId, JobState, Task, TaskLimits};
use crate::storage::{JobFilter, JobStore};
use super::accountant::AccountantHandle;
use super::limiter::LimiterHandle;

/// Tasks produced by one loader pass
#[derive(Debug, Default)]
pub struct LoadedBatch {
    pub tasks: Vec<Task>,

    /// Loaded jobs with the number of tasks each one expanded into
    pub jobs: Vec<(JobId, usize)>,
}

/// Turns pending jobs of the store into dispatchable tasks
pub struct JobLoader {
    store: Arc<dyn JobStore>,
    accountant: AccountantHandle,
    limiter: LimiterHandle,
    settings: CoordinatorSettings,
    exceptions: HostExceptionSettings,
    default_limits: TaskLimits,
}

impl JobLoader {
    pub fn new(
        store: Arc<dyn JobStore>,
        accountant: AccountantHandle,
        limiter: LimiterHandle,
        settings: CoordinatorSettings,
        exceptions: HostExceptionSettings,
        default_limits: TaskLimits,
    ) -> Self {
        Self { store, accountant, limiter, settings, exceptions, default_limits }
    }

    /// Load the next batch. Failures are logged and yield an empty batch.
    pub async fn load_batch(&self) -> LoadedBatch {
        let active = match self.accountant.active_count().await {
            Ok(active) => active,
            Err(e) => {
                warn!("Skipping job load: {}", e);
                return LoadedBatch::default();
            }
        };

        if active >= self.settings.max_tasks_in_flight {
            debug!("{} tasks in flight, not loading more", active);
            return LoadedBatch::default();
        }
        let room = self.settings.batch_size.min(self.settings.max_tasks_in_flight - active);

        let mut queued = match self.accountant.ready_per_host().await {
            Ok(queued) => queued,
            Err(e) => {
                warn!("Skipping job load: {}", e);
                return LoadedBatch::default();
            }
        };

        let saturated = match self.limiter.saturated_hosts().await {
            Ok(saturated) => saturated,
            Err(e) => {
                warn!("Skipping job load: {}", e);
                return LoadedBatch::default();
            }
        };

        // Hosts without a free slot or with plenty of queued work are left alone this round
        let mut excluded = self.exceptions.ignored_hosts.clone();
        excluded.extend(saturated);
        excluded.extend(
            queued
                .iter()
                .filter(|(_, count)| **count > self.settings.tasks_per_host)
                .map(|(host, _)| host.clone()),
        );
        let filter = JobFilter::excluding(excluded);

        let jobs = match self.store.read_pending_jobs(self.settings.batch_size, &filter).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed to read pending jobs: {:#}", e);
                return LoadedBatch::default();
            }
        };

        let mut batch = LoadedBatch::default();

        for job in jobs {
            if batch.tasks.len() >= room {
                break;
            }

            let tasks: Vec<Task> = job
                .into_tasks(&self.default_limits)
                .into_iter()
                .filter(|task| !self.exceptions.is_ignored(&task.host))
                .collect();

            if tasks.is_empty() {
                debug!("Job {} has no loadable documents", job.id);
                continue;
            }

            if !batch.tasks.is_empty() && batch.tasks.len() + tasks.len() > room {
                continue;
            }

            let mut per_host: HashMap<String, usize> = HashMap::new();
            for task in &tasks {
                *per_host.entry(task.host.clone()).or_insert(0) += 1;
            }

            let free = match self.limiter.free_slots(per_host.keys().cloned().collect()).await {
                Ok(free) => free,
                Err(e) => {
                    warn!("Stopping job load: {}", e);
                    break;
                }
            };
            if let Some((host, _)) = free.iter().find(|(_, slots)| **slots == 0) {
                debug!("Skipping job {}: no free connection slot on {}", job.id, host);
                continue;
            }

            let crowded = per_host.iter().find(|(host, count)| {
                let already = queued.get(*host).copied().unwrap_or(0);
                already > 0 && already + **count > self.settings.tasks_per_host
            });
            if let Some((host, _)) = crowded {
                debug!("Skipping job {}: too many queued tasks on {}", job.id, host);
                continue;
            }

            if let Err(e) = self.store.update_job_state(&job.id, JobState::Loaded).await {
                warn!("Failed to mark job {} as loaded: {:#}", job.id, e);
                continue;
            }

            for (host, count) in per_host {
                *queued.entry(host).or_insert(0) += count;
            }
            batch.jobs.push((job.id.clone(), tasks.len()));
            batch.tasks.extend(tasks);
        }

        if batch.tasks.is_empty() {
            return batch;
        }

        if let Err(e) = self.accountant.register(batch.tasks.clone()).await {
            warn!("Failed to register loaded tasks: {}", e);
            return LoadedBatch::default();
        }

        info!("Loaded {} tasks from {} jobs", batch.tasks.len(), batch.jobs.len());
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::LimitSettings;
    use crate::cluster::limiter::SlotTable;
    use crate::domain::{DocumentReference, Job, TaskType};
    use crate::storage::{MemoryJobStore, MockJobStore, WriteAck};

    fn settings(batch_size: usize, max_tasks_in_flight: usize) -> CoordinatorSettings {
        CoordinatorSettings { batch_size, max_tasks_in_flight, tasks_per_host: 30, ..CoordinatorSettings::default() }
    }

    fn loader(
        store: Arc<dyn JobStore>,
        coordinator: CoordinatorSettings,
        max_connections: usize,
        exceptions: HostExceptionSettings,
    ) -> JobLoader {
        let limits = LimitSettings { max_concurrent_connections: max_connections, ..LimitSettings::default() };
        JobLoader::new(
            store,
            AccountantHandle::spawn(),
            LimiterHandle::spawn(SlotTable::new(&limits, &exceptions)),
            coordinator,
            exceptions,
            limits.task_limits(),
        )
    }

    async fn submit(store: &MemoryJobStore, url: &str) -> Job {
        let job = Job::new(vec![DocumentReference::new(url, TaskType::CheckLink)]);
        store.submit_job(&job, WriteAck::Acknowledged).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_ignored_host_never_loaded() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..10 {
            submit(&store, &format!("https://blocked.org/{}", i)).await;
        }
        let open = submit(&store, "https://open.org/1").await;

        let exceptions = HostExceptionSettings {
            ignored_hosts: vec!["blocked.org".to_string()],
            ..HostExceptionSettings::default()
        };
        let loader = loader(store.clone(), settings(1000, 5000), 2, exceptions);

        let batch = loader.load_batch().await;
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.jobs, vec![(open.id.clone(), 1)]);
        assert!(batch.tasks.iter().all(|t| t.host != "blocked.org"));

        // Nothing left but ignored jobs
        assert!(loader.load_batch().await.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_batch_bounded_by_in_flight_ceiling() {
        let store = Arc::new(MemoryJobStore::new());
        for host in ["a.org", "b.org", "c.org"] {
            submit(&store, &format!("https://{}/x", host)).await;
        }

        let loader = loader(store.clone(), settings(10, 2), 1, HostExceptionSettings::default());

        let first = loader.load_batch().await;
        assert_eq!(first.tasks.len(), 2);
        assert!(loader.load_batch().await.tasks.is_empty());

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Loaded), Some(&2));
        assert_eq!(counts.get(&JobState::Ready), Some(&1));
    }

    #[tokio::test]
    async fn test_store_failure_yields_empty_batch() {
        let mut store = MockJobStore::new();
        store
            .expect_read_pending_jobs()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));
        store.expect_update_job_state().never();

        let loader = loader(Arc::new(store), settings(10, 100), 2, HostExceptionSettings::default());

        assert!(loader.load_batch().await.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_host_without_free_slot_is_skipped() {
        let store = Arc::new(MemoryJobStore::new());
        let busy = submit(&store, "https://busy.org/1").await;

        let limits = LimitSettings { max_concurrent_connections: 1, ..LimitSettings::default() };
        let exceptions = HostExceptionSettings::default();
        let limiter = LimiterHandle::spawn(SlotTable::new(&limits, &exceptions));
        assert!(limiter.reserve("busy.org", "elsewhere").await.unwrap());

        let loader = JobLoader::new(
            store.clone(),
            AccountantHandle::spawn(),
            limiter.clone(),
            settings(10, 100),
            exceptions,
            limits.task_limits(),
        );
        assert!(loader.load_batch().await.tasks.is_empty());

        limiter.release("elsewhere").await.unwrap();
        let batch = loader.load_batch().await;
        assert_eq!(batch.jobs, vec![(busy.id, 1)]);
    }

    #[tokio::test]
    async fn test_saturated_host_does_not_starve_others() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..4 {
            submit(&store, &format!("https://busy.org/{}", i)).await;
        }
        let idle = submit(&store, "https://idle.org/1").await;

        let limits = LimitSettings { max_concurrent_connections: 1, ..LimitSettings::default() };
        let exceptions = HostExceptionSettings::default();
        let limiter = LimiterHandle::spawn(SlotTable::new(&limits, &exceptions));
        assert!(limiter.reserve("busy.org", "elsewhere").await.unwrap());

        let loader = JobLoader::new(
            store.clone(),
            AccountantHandle::spawn(),
            limiter,
            settings(2, 100),
            exceptions,
            limits.task_limits(),
        );

        let batch = loader.load_batch().await;
        assert_eq!(batch.jobs, vec![(idle.id.clone(), 1)]);
        assert!(batch.tasks.iter().all(|t| t.host == "idle.org"));
        assert_eq!(store.job(&idle.id).await.unwrap().state, JobState::Loaded);

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Ready), Some(&4));
    }
}

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cli::config::RestarterSettings;
use crate::domain::Job;
use crate::storage::{JobStore, WriteAck};

/// Re-submits jobs for processing profiles whose latest job went stale
pub struct JobRestarter {
    store: Arc<dyn JobStore>,
    staleness_window: ChronoDuration,
    period: Duration,
}

impl JobRestarter {
    pub fn new(store: Arc<dyn JobStore>, settings: &RestarterSettings) -> Self {
        Self {
            store,
            staleness_window: ChronoDuration::seconds(settings.staleness_window_secs as i64),
            period: Duration::from_secs(settings.period_secs.max(1)),
        }
    }

    /// Whether a profile whose latest job is `latest` needs a fresh job
    pub fn needs_restart(&self, latest: Option<&Job>, now: DateTime<Utc>) -> bool {
        let Some(job) = latest else {
            return true;
        };

        if job.state.is_terminal() {
            // Finished work is redone once the window has passed
            now - job.created_at > self.staleness_window
        } else {
            // Unfinished work that has not moved within the window is stuck
            now - job.updated_at > self.staleness_window
        }
    }

    /// One sweep over every profile; returns the number of jobs submitted
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let profiles = self.store.list_profiles().await?;
        let mut submitted = 0;

        for profile in profiles {
            let latest = self.store.latest_job_for_profile(&profile.id).await?;
            if !self.needs_restart(latest.as_ref(), now) {
                continue;
            }

            let job = profile.new_job();
            self.store.submit_job(&job, WriteAck::Acknowledged).await?;
            info!("Restarted profile {} as job {}", profile.id, job.id);
            submitted += 1;
        }

        debug!("Restarter submitted {} jobs", submitted);
        Ok(submitted)
    }

    /// Sweep forever on the configured period
    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                error!("Job restarter sweep failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DocumentReference, JobState, ProcessingProfile, TaskType};
    use crate::storage::MemoryJobStore;

    fn settings() -> RestarterSettings {
        RestarterSettings { enabled: true, period_secs: 60, staleness_window_secs: 3600 }
    }

    fn profile(id: &str) -> ProcessingProfile {
        ProcessingProfile {
            id: id.to_string(),
            documents: vec![DocumentReference::new("https://a.org/1", TaskType::ConditionalDownload)],
            limits: None,
        }
    }

    #[test]
    fn test_needs_restart_rules() {
        let restarter = JobRestarter::new(Arc::new(MemoryJobStore::new()), &settings());
        let now = Utc::now();
        let mut job = profile("p").new_job();

        assert!(restarter.needs_restart(None, now));

        // Fresh and running
        job.state = JobState::Loaded;
        assert!(!restarter.needs_restart(Some(&job), now));

        // Running but idle past the window
        job.updated_at = now - ChronoDuration::hours(2);
        assert!(restarter.needs_restart(Some(&job), now));

        // Finished recently
        job.state = JobState::Finished;
        assert!(!restarter.needs_restart(Some(&job), now));

        // Finished long ago
        job.created_at = now - ChronoDuration::hours(2);
        assert!(restarter.needs_restart(Some(&job), now));
    }

    #[tokio::test]
    async fn test_run_once_is_idempotent() {
        let store = Arc::new(MemoryJobStore::new());
        store.save_profile(&profile("p1")).await.unwrap();
        store.save_profile(&profile("p2")).await.unwrap();

        let restarter = JobRestarter::new(store.clone(), &settings());
        let now = Utc::now();

        assert_eq!(restarter.run_once(now).await.unwrap(), 2);
        assert_eq!(restarter.run_once(now).await.unwrap(), 0);

        let latest = store.latest_job_for_profile("p1").await.unwrap().unwrap();
        assert_eq!(latest.state, JobState::Ready);
        assert_eq!(latest.profile_id.as_deref(), Some("p1"));
        assert_eq!(latest.documents[0].url, "https://a.org/1");
    }
}

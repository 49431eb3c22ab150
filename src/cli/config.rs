use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::debug;

use crate::domain::TaskLimits;
use crate::httpclient::ResponseType;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HarvesterConfig {
    pub coordinator: CoordinatorSettings,
    pub limits: LimitSettings,
    pub host_exceptions: HostExceptionSettings,
    pub worker: WorkerSettings,
    pub store: StoreSettings,
    pub transport: TransportSettings,
}

/// Coordinator scheduling settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Number of tasks loaded per batch
    pub batch_size: usize,

    /// Ceiling on loaded, non-terminal tasks
    pub max_tasks_in_flight: usize,

    /// Queued-but-not-started tasks after which a host counts as overloaded
    pub tasks_per_host: usize,

    pub monitor_interval_secs: u64,

    pub cleanup_interval_hours: u64,

    pub task_timeout_check_interval_secs: u64,

    /// Silence after which a worker is reported unreachable
    pub worker_unreachable_after_secs: u64,

    pub restarter: RestarterSettings,
}

/// Job restarter settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RestarterSettings {
    pub enabled: bool,
    pub period_secs: u64,
    pub staleness_window_secs: u64,
}

/// Default per-task limits and admission settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LimitSettings {
    /// Connections allowed per host
    pub max_concurrent_connections: usize,
    pub bandwidth_limit_read_bytes_per_sec: u64,
    pub connection_timeout_ms: u64,
    pub max_redirects: usize,
    pub termination_size_limit_bytes: u64,
    pub termination_time_limit_ms: u64,
    pub termination_min_bytes_per_sec: u64,
    pub limits_check_interval_ms: u64,

    /// Reservations older than this are force-released
    pub max_job_processing_duration_secs: u64,
}

/// Per-host overrides
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostExceptionSettings {
    /// Connection limit applied to the listed hosts
    pub max_concurrent_connections: usize,

    pub hosts: Vec<String>,

    /// Hosts whose jobs are never loaded
    pub ignored_hosts: Vec<String>,
}

/// Worker node settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    /// Fixed worker identity; a fresh one is generated when absent
    pub worker_id: Option<String>,

    /// Tasks executed concurrently
    pub task_limit: usize,

    pub response_type: ResponseType,

    /// Directory of disk-stored responses
    pub path_to_save: PathBuf,

    /// Directory of generated thumbnails
    pub media_storage_path: PathBuf,

    pub hard_deadline_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeat_limit: u32,
    pub coordinator_missed_pong_limit: u32,
    pub coordinator_grace_secs: u64,
    pub watchdog_timeout_secs: u64,
}

/// Job store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreSettings {
    pub storage_type: String, // "mongodb", "memory"
    pub connection_string: String,
    pub database_name: String,
    pub collection_prefix: String,
}

/// Coordinator/worker transport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransportSettings {
    pub transport_type: String, // "redis", "local"
    pub redis_url: String,
    pub message_ttl_secs: u64, // Time to live for inbox keys in seconds
    pub poll_timeout_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_tasks_in_flight: 5000,
            tasks_per_host: 30,
            monitor_interval_secs: 600,
            cleanup_interval_hours: 6,
            task_timeout_check_interval_secs: 60,
            worker_unreachable_after_secs: 600,
            restarter: RestarterSettings::default(),
        }
    }
}

impl Default for RestarterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            period_secs: 3600,
            staleness_window_secs: 86400,
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        let task = TaskLimits::default();
        Self {
            max_concurrent_connections: 2,
            bandwidth_limit_read_bytes_per_sec: task.bandwidth_limit_read_bytes_per_sec,
            connection_timeout_ms: task.connection_timeout_ms,
            max_redirects: task.max_redirects,
            termination_size_limit_bytes: task.termination_size_limit_bytes,
            termination_time_limit_ms: task.termination_time_limit_ms,
            termination_min_bytes_per_sec: task.termination_min_bytes_per_sec,
            limits_check_interval_ms: task.limits_check_interval_ms,
            max_job_processing_duration_secs: 1800,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let base = data_dir();
        Self {
            worker_id: None,
            task_limit: 32,
            response_type: ResponseType::MemoryStorage,
            path_to_save: base.join("responses"),
            media_storage_path: base.join("media"),
            hard_deadline_secs: 1800,
            heartbeat_interval_secs: 180,
            missed_heartbeat_limit: 3,
            coordinator_missed_pong_limit: 3,
            coordinator_grace_secs: 300,
            watchdog_timeout_secs: 3600,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            storage_type: "mongodb".to_string(),
            connection_string: "mongodb://localhost:27017".to_string(),
            database_name: "harvester".to_string(),
            collection_prefix: "harvest".to_string(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            transport_type: "redis".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            message_ttl_secs: 86400,
            poll_timeout_secs: 1,
        }
    }
}

impl LimitSettings {
    /// Per-task limits handed to the retrieval engine
    pub fn task_limits(&self) -> TaskLimits {
        TaskLimits {
            bandwidth_limit_read_bytes_per_sec: self.bandwidth_limit_read_bytes_per_sec,
            max_redirects: self.max_redirects,
            connection_timeout_ms: self.connection_timeout_ms,
            termination_size_limit_bytes: self.termination_size_limit_bytes,
            termination_time_limit_ms: self.termination_time_limit_ms,
            termination_min_bytes_per_sec: self.termination_min_bytes_per_sec,
            limits_check_interval_ms: self.limits_check_interval_ms,
        }
    }

    pub fn max_job_processing_duration(&self) -> Duration {
        Duration::from_secs(self.max_job_processing_duration_secs)
    }
}

impl HostExceptionSettings {
    pub fn is_ignored(&self, host: &str) -> bool {
        self.ignored_hosts.iter().any(|ignored| ignored.eq_ignore_ascii_case(host))
    }

    pub fn is_excepted(&self, host: &str) -> bool {
        self.hosts.iter().any(|excepted| excepted.eq_ignore_ascii_case(host))
    }
}

/// Get the directory used for runtime data
fn data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("org", "harvester", "harvester") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./data")
    }
}

impl HarvesterConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("org", "harvester", "harvester") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Path of the configuration file used when none is given
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("harvester.yaml")
    }

    /// Load the given file, or the default path when none is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_from_file(&Self::default_path()),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let yaml = r#"
coordinator:
  batch_size: 2
limits:
  max_concurrent_connections: 1
host_exceptions:
  ignored_hosts: ["blocked.org"]
"#;
        let config: HarvesterConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.coordinator.batch_size, 2);
        assert_eq!(config.coordinator.max_tasks_in_flight, 5000);
        assert_eq!(config.limits.max_concurrent_connections, 1);
        assert_eq!(config.limits.connection_timeout_ms, 10_000);
        assert_eq!(config.worker.heartbeat_interval_secs, 180);
        assert_eq!(config.worker.response_type, ResponseType::MemoryStorage);
        assert!(config.host_exceptions.is_ignored("BLOCKED.org"));
        assert!(!config.host_exceptions.is_ignored("open.org"));
    }

    #[test]
    fn test_missing_file_fails() {
        let path = std::env::temp_dir().join(format!("harvester-missing-{}.yaml", uuid::Uuid::new_v4()));
        assert!(HarvesterConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("harvester-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("harvester.yaml");

        let mut config = HarvesterConfig::default();
        config.store.storage_type = "memory".to_string();
        config.worker.response_type = ResponseType::DiskStorage;
        config.save_to_file(&path).unwrap();

        let loaded = HarvesterConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.store.storage_type, "memory");
        assert_eq!(loaded.worker.response_type, ResponseType::DiskStorage);
        assert_eq!(loaded.limits.task_limits(), config.limits.task_limits());

        fs::remove_dir_all(dir).unwrap();
    }
}

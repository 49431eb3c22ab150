use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

pub type TaskId = String;
pub type JobId = String;

/// What the worker is expected to do with a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Only check that the link answers; the body is never read
    CheckLink,

    /// Download only if etag/last-modified/content-length changed since the previous attempt
    ConditionalDownload,

    /// Download no matter what
    UnconditionalDownload,
}

/// Post-download processing step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubTask {
    ColorExtraction,
    MetaExtraction,
    GenerateThumbnail { width: u32, height: u32 },
}

/// Resolved per-task limits used by the retrieval engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLimits {
    /// Read bandwidth cap (0 = uncapped)
    pub bandwidth_limit_read_bytes_per_sec: u64,

    /// Maximum number of redirects followed
    pub max_redirects: usize,

    /// Maximum time allowed until the response status arrives
    pub connection_timeout_ms: u64,

    /// Abort the transfer once more than this many bytes were read (0 = unlimited)
    pub termination_size_limit_bytes: u64,

    /// Abort the whole attempt after this long
    pub termination_time_limit_ms: u64,

    /// Abort when the average throughput falls below this (0 = disabled)
    pub termination_min_bytes_per_sec: u64,

    /// Grace period before the throughput threshold is enforced
    pub limits_check_interval_ms: u64,
}

impl TaskLimits {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.termination_time_limit_ms)
    }

    pub fn limits_check_interval(&self) -> Duration {
        Duration::from_millis(self.limits_check_interval_ms)
    }
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            bandwidth_limit_read_bytes_per_sec: 0,
            max_redirects: 10,
            connection_timeout_ms: 10_000,
            termination_size_limit_bytes: 0,
            termination_time_limit_ms: 300_000,
            termination_min_bytes_per_sec: 0,
            limits_check_interval_ms: 5_000,
        }
    }
}

/// A dispatchable unit of retrieval and processing work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier of this task
    pub id: TaskId,

    /// Job the task was derived from
    pub job_id: JobId,

    /// Identifier of the source document inside the job
    pub reference_id: String,

    /// URL to retrieve
    pub url: String,

    /// Host used for admission control
    pub host: String,

    pub task_type: TaskType,

    pub sub_tasks: Vec<SubTask>,

    pub limits: TaskLimits,

    /// Response headers recorded by the previous attempt, used by conditional downloads
    #[serde(default)]
    pub previous_headers: BTreeMap<String, String>,
}

impl Task {
    /// Whether the task carries any processing sub-task
    pub fn needs_processing(&self) -> bool {
        self.task_type != TaskType::CheckLink && !self.sub_tasks.is_empty()
    }
}

/// Extract the lower-cased host of a URL
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_lowercase()))
}

/// Coordinator-side lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Downloading,
    Processing,
    Done,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error)
    }

    /// Forward-only ordering; `Error` is reachable from every non-terminal state
    pub fn can_transition_to(self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TaskState::Error => true,
            _ => next.rank() > self.rank(),
        }
    }

    fn rank(self) -> u8 {
        match self {
            TaskState::Ready => 0,
            TaskState::Downloading => 1,
            TaskState::Processing => 2,
            TaskState::Done | TaskState::Error => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://Example.COM/a.jpg"), Some("example.com".to_string()));
        assert_eq!(host_of("http://10.0.0.1:8080/x"), Some("10.0.0.1".to_string()));
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn test_task_state_transitions() {
        assert!(TaskState::Ready.can_transition_to(TaskState::Downloading));
        assert!(TaskState::Downloading.can_transition_to(TaskState::Processing));
        assert!(TaskState::Processing.can_transition_to(TaskState::Done));
        assert!(TaskState::Ready.can_transition_to(TaskState::Error));

        assert!(!TaskState::Processing.can_transition_to(TaskState::Downloading));
        assert!(!TaskState::Done.can_transition_to(TaskState::Error));
        assert!(!TaskState::Error.can_transition_to(TaskState::Done));
    }

    #[test]
    fn test_sub_task_serialization() {
        let json = serde_json::to_string(&SubTask::GenerateThumbnail { width: 180, height: 180 }).unwrap();
        assert_eq!(json, r#"{"kind":"generate_thumbnail","width":180,"height":180}"#);
    }
}

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;

use super::stats::{RetrieveState, SubTaskState, SubTaskStats};
use super::task::{JobId, Task, TaskId};

/// What one retrieval attempt produced, as reported by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub state: RetrieveState,

    #[serde(default)]
    pub http_status: Option<u16>,

    /// Resolved address of the remote host
    pub source_ip: String,

    /// Lower-cased response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    pub bytes_read: u64,

    pub duration_ms: u64,

    pub connection_setup_ms: u64,

    #[serde(default)]
    pub log: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

impl RetrievalOutcome {
    /// Outcome for a task that never got a completion report
    pub fn abandoned(log: impl Into<String>) -> Self {
        Self {
            state: RetrieveState::Error,
            http_status: None,
            source_ip: String::new(),
            headers: BTreeMap::new(),
            bytes_read: 0,
            duration_ms: 0,
            connection_setup_ms: 0,
            log: Some(log.into()),
            error: None,
        }
    }
}

/// Metadata extracted from a retrieved resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub mime_type: Option<String>,

    pub size_bytes: u64,

    pub width: Option<u32>,

    pub height: Option<u32>,
}

/// Stored outcome of one task, keyed by task id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,

    pub job_id: JobId,

    pub reference_id: String,

    pub url: String,

    pub stats: SubTaskStats,

    pub overall: SubTaskState,

    pub retrieval: Option<RetrievalOutcome>,

    #[serde(default)]
    pub meta_info: Option<MetaInfo>,

    #[serde(default)]
    pub color_tags: Vec<String>,

    /// Storage keys of generated thumbnails
    #[serde(default)]
    pub thumbnails: Vec<String>,

    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(task: &Task, stats: SubTaskStats, retrieval: Option<RetrievalOutcome>) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            reference_id: task.reference_id.clone(),
            url: task.url.clone(),
            overall: stats.overall_state(),
            stats,
            retrieval,
            meta_info: None,
            color_tags: Vec::new(),
            thumbnails: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Result recorded when a task's reservation expired without a report
    pub fn abandoned(task: &Task, log: impl Into<String>) -> Self {
        let log = log.into();
        let stats = SubTaskStats::default().with_retrieve_state(RetrieveState::Error, Some(log.clone()));
        Self::new(task, stats, Some(RetrievalOutcome::abandoned(log)))
    }

    /// Whether the task should be counted as failed by the coordinator
    pub fn is_error(&self) -> bool {
        self.overall == SubTaskState::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{TaskLimits, TaskType};

    fn sample_task() -> Task {
        Task {
            id: "t1".to_string(),
            job_id: "j1".to_string(),
            reference_id: "r1".to_string(),
            url: "https://a.org/x".to_string(),
            host: "a.org".to_string(),
            task_type: TaskType::UnconditionalDownload,
            sub_tasks: vec![],
            limits: TaskLimits::default(),
            previous_headers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_abandoned_result_is_error() {
        let result = TaskResult::abandoned(&sample_task(), "no completion report within 1800s");

        assert!(result.is_error());
        assert_eq!(result.stats.retrieve_state, RetrieveState::Error);
        assert_eq!(
            result.retrieval.as_ref().and_then(|r| r.log.as_deref()),
            Some("no completion report within 1800s")
        );
    }

    #[test]
    fn test_overall_derived_from_stats() {
        let stats = SubTaskStats::default().with_retrieve_state(RetrieveState::FinishedSizeLimit, None);
        let result = TaskResult::new(&sample_task(), stats, None);
        assert_eq!(result.overall, SubTaskState::Failed);
        assert!(!result.is_error());
    }
}

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use super::task::{host_of, JobId, SubTask, Task, TaskLimits, TaskType};

/// Persistent lifecycle of a stored job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting to be picked up by the loader
    Ready,

    /// Expanded into tasks held by a running coordinator
    Loaded,

    Finished,

    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "READY",
            JobState::Loaded => "LOADED",
            JobState::Finished => "FINISHED",
            JobState::Error => "ERROR",
        }
    }
}

/// One source document of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReference {
    pub reference_id: String,

    pub url: String,

    pub task_type: TaskType,

    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,

    /// Headers recorded by the last retrieval of this document
    #[serde(default)]
    pub previous_headers: BTreeMap<String, String>,
}

impl DocumentReference {
    pub fn new(url: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            reference_id: Uuid::new_v4().to_string(),
            url: url.into(),
            task_type,
            sub_tasks: Vec::new(),
            previous_headers: BTreeMap::new(),
        }
    }

    pub fn with_sub_tasks(mut self, sub_tasks: Vec<SubTask>) -> Self {
        self.sub_tasks = sub_tasks;
        self
    }
}

/// A stored unit of work that expands into one task per document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Processing profile this job was derived from, if any
    #[serde(default)]
    pub profile_id: Option<String>,

    /// Host of the first document, used by store-side host filtering
    pub host: String,

    pub documents: Vec<DocumentReference>,

    /// Overrides the configured default limits when present
    #[serde(default)]
    pub limits: Option<TaskLimits>,

    pub state: JobState,

    #[serde(default)]
    pub priority: i32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(documents: Vec<DocumentReference>) -> Self {
        let now = Utc::now();
        let host = documents
            .first()
            .and_then(|doc| host_of(&doc.url))
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4().to_string(),
            profile_id: None,
            host,
            documents,
            limits: None,
            state: JobState::Ready,
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn with_limits(mut self, limits: TaskLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Expand the job into dispatchable tasks. Documents with an unparsable URL are skipped.
    pub fn into_tasks(&self, defaults: &TaskLimits) -> Vec<Task> {
        let limits = self.limits.clone().unwrap_or_else(|| defaults.clone());

        self.documents
            .iter()
            .filter_map(|doc| {
                let Some(host) = host_of(&doc.url) else {
                    warn!("Skipping document {} of job {}: invalid URL {}", doc.reference_id, self.id, doc.url);
                    return None;
                };

                Some(Task {
                    id: Uuid::new_v4().to_string(),
                    job_id: self.id.clone(),
                    reference_id: doc.reference_id.clone(),
                    url: doc.url.clone(),
                    host,
                    task_type: doc.task_type,
                    sub_tasks: doc.sub_tasks.clone(),
                    limits: limits.clone(),
                    previous_headers: doc.previous_headers.clone(),
                })
            })
            .collect()
    }
}

/// A reusable set of source documents the restarter keeps fresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingProfile {
    pub id: String,

    pub documents: Vec<DocumentReference>,

    #[serde(default)]
    pub limits: Option<TaskLimits>,
}

impl ProcessingProfile {
    /// Build a fresh job referencing the profile's documents
    pub fn new_job(&self) -> Job {
        let mut job = Job::new(self.documents.clone()).with_profile(self.id.clone());
        job.limits = self.limits.clone();
        job
    }
}

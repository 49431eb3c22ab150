use serde::{Serialize, Deserialize};

/// Outcome of one processing sub-task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubTaskState {
    NeverExecuted,
    Success,
    Failed,
    Error,
}

/// Outcome of the retrieval sub-task, which may also end on a policy threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrieveState {
    NeverExecuted,
    Success,
    Failed,
    Error,
    FinishedRateLimit,
    FinishedSizeLimit,
    FinishedTimeLimit,
}

impl RetrieveState {
    pub const ALL: [RetrieveState; 7] = [
        RetrieveState::NeverExecuted,
        RetrieveState::Success,
        RetrieveState::Failed,
        RetrieveState::Error,
        RetrieveState::FinishedRateLimit,
        RetrieveState::FinishedSizeLimit,
        RetrieveState::FinishedTimeLimit,
    ];

    fn is_limit(self) -> bool {
        matches!(
            self,
            RetrieveState::FinishedRateLimit
                | RetrieveState::FinishedSizeLimit
                | RetrieveState::FinishedTimeLimit
        )
    }
}

impl SubTaskState {
    pub const ALL: [SubTaskState; 4] = [
        SubTaskState::NeverExecuted,
        SubTaskState::Success,
        SubTaskState::Failed,
        SubTaskState::Error,
    ];
}

/// Per sub-task states and logs of a finished task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskStats {
    pub retrieve_state: RetrieveState,
    pub retrieve_log: Option<String>,
    pub color_extraction_state: SubTaskState,
    pub color_extraction_log: Option<String>,
    pub meta_extraction_state: SubTaskState,
    pub meta_extraction_log: Option<String>,
    pub thumbnail_generation_state: SubTaskState,
    pub thumbnail_generation_log: Option<String>,
    pub thumbnail_storage_state: SubTaskState,
    pub thumbnail_storage_log: Option<String>,
}

impl Default for SubTaskStats {
    fn default() -> Self {
        Self {
            retrieve_state: RetrieveState::NeverExecuted,
            retrieve_log: None,
            color_extraction_state: SubTaskState::NeverExecuted,
            color_extraction_log: None,
            meta_extraction_state: SubTaskState::NeverExecuted,
            meta_extraction_log: None,
            thumbnail_generation_state: SubTaskState::NeverExecuted,
            thumbnail_generation_log: None,
            thumbnail_storage_state: SubTaskState::NeverExecuted,
            thumbnail_storage_log: None,
        }
    }
}

impl SubTaskStats {
    pub fn with_retrieve_state(mut self, state: RetrieveState, log: Option<String>) -> Self {
        self.retrieve_state = state;
        self.retrieve_log = log;
        self
    }

    pub fn with_color_extraction_state(mut self, state: SubTaskState, log: Option<String>) -> Self {
        self.color_extraction_state = state;
        self.color_extraction_log = log;
        self
    }

    pub fn with_meta_extraction_state(mut self, state: SubTaskState, log: Option<String>) -> Self {
        self.meta_extraction_state = state;
        self.meta_extraction_log = log;
        self
    }

    pub fn with_thumbnail_generation_state(mut self, state: SubTaskState, log: Option<String>) -> Self {
        self.thumbnail_generation_state = state;
        self.thumbnail_generation_log = log;
        self
    }

    pub fn with_thumbnail_storage_state(mut self, state: SubTaskState, log: Option<String>) -> Self {
        self.thumbnail_storage_state = state;
        self.thumbnail_storage_log = log;
        self
    }

    fn processing_states(&self) -> [SubTaskState; 4] {
        [
            self.color_extraction_state,
            self.meta_extraction_state,
            self.thumbnail_generation_state,
            self.thumbnail_storage_state,
        ]
    }

    /// Overall state; the first matching rule wins:
    /// any ERROR, then any FAILED or retrieval limit, then all NEVER_EXECUTED, else SUCCESS.
    pub fn overall_state(&self) -> SubTaskState {
        let processing = self.processing_states();

        if self.retrieve_state == RetrieveState::Error
            || processing.contains(&SubTaskState::Error)
        {
            return SubTaskState::Error;
        }

        if self.retrieve_state == RetrieveState::Failed
            || self.retrieve_state.is_limit()
            || processing.contains(&SubTaskState::Failed)
        {
            return SubTaskState::Failed;
        }

        if self.retrieve_state == RetrieveState::NeverExecuted
            && processing.iter().all(|state| *state == SubTaskState::NeverExecuted)
        {
            return SubTaskState::NeverExecuted;
        }

        SubTaskState::Success
    }
}

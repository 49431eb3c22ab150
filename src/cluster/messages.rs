use serde::{Serialize, Deserialize};

use crate::domain::{RetrievalOutcome, Task, TaskId, TaskResult};

/// Messages a worker sends to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Ask for up to `capacity` tasks
    RequestTasks { worker_id: String, capacity: usize },

    StartedTask { worker_id: String, task_id: TaskId },

    /// Retrieval finished; processing may follow
    DoneDownload { worker_id: String, task_id: TaskId, outcome: RetrievalOutcome },

    /// Task finished; carries the result to persist
    DoneProcessing { worker_id: String, result: TaskResult },

    ReserveConnectionSlot { worker_id: String, request_id: u64, host: String, task_id: TaskId },

    ReturnConnectionSlot { worker_id: String, task_id: TaskId },

    Ping { worker_id: String },
}

impl CoordinatorMessage {
    pub fn worker_id(&self) -> &str {
        match self {
            CoordinatorMessage::RequestTasks { worker_id, .. }
            | CoordinatorMessage::StartedTask { worker_id, .. }
            | CoordinatorMessage::DoneDownload { worker_id, .. }
            | CoordinatorMessage::DoneProcessing { worker_id, .. }
            | CoordinatorMessage::ReserveConnectionSlot { worker_id, .. }
            | CoordinatorMessage::ReturnConnectionSlot { worker_id, .. }
            | CoordinatorMessage::Ping { worker_id } => worker_id,
        }
    }
}

/// Messages the coordinator sends to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    BagOfTasks { tasks: Vec<Task> },

    SlotReservation { request_id: u64, granted: bool },

    Pong,
}

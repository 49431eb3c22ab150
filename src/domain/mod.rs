pub mod job;
pub mod result;
pub mod stats;
pub mod task;

// Re-export common types
pub use job::{DocumentReference, Job, JobState, ProcessingProfile};
pub use result::{MetaInfo, RetrievalOutcome, TaskResult};
pub use stats::{RetrieveState, SubTaskState, SubTaskStats};
pub use task::{host_of, JobId, SubTask, Task, TaskId, TaskLimits, TaskState, TaskType};

pub mod executor;
pub mod heartbeat;
pub mod processing;
pub mod supervisor;
pub mod watchdog;

// Re-export common types
pub use executor::{ExecutorCommand, ExecutorConfig, ExecutorHandle};
pub use heartbeat::HeartbeatMonitor;
pub use processing::{BasicMediaProcessor, MediaProcessor, ProcessingError};
pub use supervisor::{run_worker, SupervisorExit, WorkerSupervisor};
pub use watchdog::Activity;

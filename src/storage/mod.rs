pub mod jobs;
pub mod media;
pub mod memory;
pub mod mongo;

// Re-export common types
pub use jobs::{JobFilter, JobStore, JobStoreFactory, WriteAck};
pub use media::{FileSystemMediaStorage, MediaStorage};
pub use memory::MemoryJobStore;

#[cfg(test)]
pub use jobs::MockJobStore;

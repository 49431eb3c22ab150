pub mod engine;
pub mod response;

// Re-export common types
pub use engine::RetrievalEngine;
pub use response::{ResponseType, RetrievalResponse, RetrievalState};

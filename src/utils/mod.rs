pub mod logging;
pub mod shutdown;

// Re-export common functions and types
pub use logging::{init_logging, default_log_file};

pub mod logging;
pub mod metrics;

// Re-export common functions
pub use logging::{init_logging, default_log_file};

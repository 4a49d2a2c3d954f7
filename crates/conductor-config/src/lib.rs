//! Configuration for the review conductor.
//!
//! Reads `conductor.toml`, fills in defaults and validates every section
//! before any engine is built from it:
//!
//! ```toml
//! [saga]
//! log_dir = ".conductor/sagas"
//!
//! [director]
//! interval_ms = 60000
//!
//! [resilience.circuit_breakers.github]
//! failure_threshold = 3
//!
//! [resilience.dlq]
//! enabled = true
//! ```
//!
//! Relative paths resolve against the directory holding the file. The
//! `CONDUCTOR_WEBHOOK_SECRET` environment variable replaces the webhook
//! secret from the file.

mod config;
mod error;

pub use config::{
    ConductorConfig, DEFAULT_CONFIG_FILE, DEFAULT_DIRECTOR_INTERVAL_MS, WEBHOOK_SECRET_ENV,
    load_config, parse_config,
};
pub use error::{ConfigError, Result};

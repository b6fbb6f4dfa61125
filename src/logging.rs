//! Explicit logging initialisation
//!
//! The library only emits `tracing` events and spans; nothing is installed at
//! load time. Applications (and the simulator binary) call [`init`] once at
//! startup to install a `fmt` subscriber whose filter comes from `RUST_LOG`,
//! falling back to [`LogConfig::default_level`].
//!
//! ```bash
//! # Everything from the protocol engine, info elsewhere
//! RUST_LOG=info,deapi::io::client=debug cargo run --bin de_simulator
//! ```

use tracing_subscriber::EnvFilter;

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset or invalid
    pub default_level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_number: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            with_target: true,
            with_thread_ids: true,
            with_line_number: true,
        }
    }
}

impl LogConfig {
    /// Config with a different fallback level
    pub fn with_level(level: &str) -> Self {
        Self {
            default_level: level.to_string(),
            ..Default::default()
        }
    }
}

/// Install the global `fmt` subscriber
///
/// Returns `false` if a global subscriber was already installed, in which
/// case the existing one is kept.
///
/// # Examples
///
/// ```no_run
/// use deapi::logging::{self, LogConfig};
///
/// logging::init(&LogConfig::with_level("debug"));
/// ```
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_line_number(config.with_line_number)
        .try_init()
        .is_ok()
}

//! Structured logging utilities for snapvol components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use snapvol_config::log_session_info;
//!
//! log_session_info!("Images ready", asset = "agent-42", count = 2);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const SESSION: &'static str = "SESSION";
    pub const CLONE: &'static str = "CLONE";
    pub const IMAGE: &'static str = "IMAGE";
    pub const CHECK: &'static str = "CHECK";
    pub const INJECT: &'static str = "INJECT";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === SESSION logging macros ===

#[macro_export]
macro_rules! log_session_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "SESSION", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_session_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SESSION", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_session_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SESSION", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_session_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SESSION", $($key = $value,)* $msg)
    };
}

// === CLONE logging macros ===

#[macro_export]
macro_rules! log_clone_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLONE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_clone_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLONE", $($key = $value,)* $msg)
    };
}

// === IMAGE logging macros ===

#[macro_export]
macro_rules! log_image_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "IMAGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_image_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "IMAGE", $($key = $value,)* $msg)
    };
}

// === CHECK logging macros ===

#[macro_export]
macro_rules! log_check_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CHECK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_check_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CHECK", $($key = $value,)* $msg)
    };
}

// === INJECT logging macros ===

#[macro_export]
macro_rules! log_inject_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "INJECT", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// `SNAPVOL_LOG` wins over `RUST_LOG`, which wins over `level`.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("SNAPVOL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::SESSION, "SESSION");
        assert_eq!(Component::CLONE, "CLONE");
        assert_eq!(Component::CHECK, "CHECK");
    }

    #[test]
    fn test_level_filters() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }
}

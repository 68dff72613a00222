use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel { Debug, Info, Warn, Error }

/// Sink for server-side messages that must not reach the caller, e.g. failures
/// of detached after-save triggers.
pub trait LoggerController: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

#[derive(Debug, Clone, Default)]
pub struct TracingLogger;

impl LoggerController for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "basalt::logger", "{}", message),
            LogLevel::Info => info!(target: "basalt::logger", "{}", message),
            LogLevel::Warn => warn!(target: "basalt::logger", "{}", message),
            LogLevel::Error => error!(target: "basalt::logger", "{}", message),
        }
    }
}

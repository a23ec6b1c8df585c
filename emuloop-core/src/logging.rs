//! Per-controller logging
//!
//! Each controller owns a [`ThreadLogger`] that tags every event with the
//! controller instance and name before handing it to the process-wide
//! `tracing` subscriber. The level filter is per instance, so one noisy
//! core can be turned up without touching the others.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::LogLevel;
use crate::thread::ThreadHandle;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

struct LoggerInner {
    instance: u64,
    name: String,
    level: AtomicU8,
}

/// Instance-tagged logging sink
#[derive(Clone)]
pub struct ThreadLogger {
    inner: Arc<LoggerInner>,
}

impl ThreadLogger {
    pub fn new(name: &str, level: LogLevel) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                level: AtomicU8::new(level as u8),
            }),
        }
    }

    /// Process-unique controller id carried on every event
    pub fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= self.level()
    }

    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let controller = self.inner.instance;
        let name = self.inner.name.as_str();
        match level {
            LogLevel::Off => {}
            LogLevel::Error => {
                tracing::error!(target: "emuloop::thread", controller, name, "{}", args)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "emuloop::thread", controller, name, "{}", args)
            }
            LogLevel::Info => {
                tracing::info!(target: "emuloop::thread", controller, name, "{}", args)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "emuloop::thread", controller, name, "{}", args)
            }
            LogLevel::Trace => {
                tracing::trace!(target: "emuloop::thread", controller, name, "{}", args)
            }
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Trace, args);
    }
}

impl fmt::Debug for ThreadLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLogger")
            .field("instance", &self.inner.instance)
            .field("name", &self.inner.name)
            .field("level", &self.level())
            .finish()
    }
}

/// Logger of the controller that owns the calling thread
///
/// Lets machine-core code running on the execution thread log through its
/// controller without being handed a reference.
pub fn current() -> Option<ThreadLogger> {
    ThreadHandle::current().map(|handle| handle.logger().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        let logger = ThreadLogger::new("test", LogLevel::Warn);
        assert!(logger.enabled(LogLevel::Error));
        assert!(logger.enabled(LogLevel::Warn));
        assert!(!logger.enabled(LogLevel::Info));

        logger.set_log_level(LogLevel::Trace);
        assert!(logger.enabled(LogLevel::Trace));

        logger.set_log_level(LogLevel::Off);
        assert!(!logger.enabled(LogLevel::Error));
        assert!(!logger.enabled(LogLevel::Off));
    }

    #[test]
    fn test_instances_unique() {
        let a = ThreadLogger::new("a", LogLevel::Info);
        let b = ThreadLogger::new("b", LogLevel::Info);
        assert_ne!(a.instance(), b.instance());
        assert_eq!(a.clone().instance(), a.instance());
    }

    #[test]
    fn test_no_current_off_thread() {
        assert!(current().is_none());
    }
}

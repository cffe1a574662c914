// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fmt;

pub mod aggregate;
pub mod alloc;
pub mod clock;
pub mod daemonize;
pub mod dso;
pub mod env;
pub mod export;
pub mod perf_event;
pub mod pprof;
pub mod procfs;
pub mod ringbuf;
pub mod stats;
pub mod symbols;
pub mod unwind;
pub mod watcher;
pub mod worker;

pub type IOResult<T> = std::io::Result<T>;
pub type IOError = std::io::Error;

pub fn io_error(message: &str) -> IOError {
    IOError::new(
        std::io::ErrorKind::Other,
        message)
}

/// How far an error propagates: warnings are logged and the pipeline
/// continues, fatal errors unwind to the main loop which tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Fatal,
}

/// Subsystem tag carried by every error, used for log prefixes and for
/// the teardown path to report what gave out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum What {
    #[error("perf_event_open")]
    PerfOpen,
    #[error("ring buffer")]
    RingBuffer,
    #[error("procfs")]
    Procfs,
    #[error("dso")]
    Dso,
    #[error("unwind")]
    Unwind,
    #[error("symbols")]
    Symbols,
    #[error("aggregation")]
    Aggregation,
    #[error("serialization")]
    Serialization,
    #[error("exporter")]
    Exporter,
    #[error("clock")]
    Clock,
    #[error("allocation tracker")]
    AllocTracker,
    #[error("ipc")]
    Ipc,
    #[error("daemonize")]
    Daemonize,
    #[error("worker")]
    Worker,
}

#[derive(Debug)]
pub struct ProfError {
    severity: Severity,
    what: What,
    message: String,
}

impl std::error::Error for ProfError {
}

impl fmt::Display for ProfError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            match self.severity {
                Severity::Warn => "warn",
                Severity::Fatal => "fatal",
            },
            self.what,
            self.message)
    }
}

impl ProfError {
    pub fn warn(
        what: What,
        message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warn,
            what,
            message: message.into(),
        }
    }

    pub fn fatal(
        what: What,
        message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            what,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn what(&self) -> What {
        self.what
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

pub type ProfResult<T> = Result<T, ProfError>;

/// Logs-and-swallows warnings, forwards fatal errors. The standard way
/// the worker consumes per-sample results.
pub fn check_warn<T: Default>(
    result: ProfResult<T>) -> ProfResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(error) => {
            if error.is_fatal() {
                Err(error)
            } else {
                tracing::warn!("{}", error);
                Ok(T::default())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities() {
        let warn = ProfError::warn(What::Dso, "missing mapping");
        let fatal = ProfError::fatal(What::Exporter, "3 consecutive failures");

        assert!(!warn.is_fatal());
        assert!(fatal.is_fatal());

        assert_eq!(What::Dso, warn.what());
        assert!(format!("{}", warn).contains("dso"));
        assert!(format!("{}", fatal).contains("fatal"));
    }

    #[test]
    fn warn_is_swallowed() {
        let result: ProfResult<u32> =
            Err(ProfError::warn(What::Unwind, "one bad sample"));

        assert_eq!(0, check_warn(result).unwrap());

        let result: ProfResult<u32> =
            Err(ProfError::fatal(What::Exporter, "down"));

        assert!(check_warn(result).is_err());
    }
}

//! Error types for the sorter and its GPU backends.
//!
//! | Error        | Raised by                          | Scope                 |
//! |--------------|------------------------------------|-----------------------|
//! | Config       | construction, `sort` argument check | before any GPU work   |
//! | Compile      | kernel compilation                 | aborts construction   |
//! | DeviceFault  | any failed backend operation       | aborts the `sort` call|
//! | Validation   | pre-dispatch binding check (debug) | aborts the `sort` call|
//!
//! Nothing is retried. A failed call leaves the caller's slice undefined.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::sorter::SortPhase;

/// Failure reported by a [`GpuBackend`](crate::backend::GpuBackend).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no GPU device available: {0}")]
    DeviceNotFound(String),
    #[error("kernel compilation failed: {diagnostic}")]
    Compile { diagnostic: String },
    #[error("failed to allocate {byte_length} byte buffer")]
    Allocation { byte_length: usize },
    #[error("invalid resource usage: {0}")]
    InvalidUsage(String),
    #[error("resource handle is stale or was released")]
    StaleHandle,
    #[error("device removed")]
    DeviceRemoved,
    #[error("GPU execution failed: {0}")]
    Execution(String),
    #[error("dispatch validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("invalid configuration: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("failed to compile kernel '{entry_point}' from {}", .path.display())]
    Compile {
        entry_point: String,
        path: PathBuf,
        #[source]
        source: BackendError,
    },
    #[error("device fault while {phase}{}", removed_reason(.reason))]
    DeviceFault {
        phase: SortPhase,
        reason: Option<String>,
        #[source]
        source: BackendError,
    },
    #[error("pipeline validation failed before the {kernel} dispatch")]
    Validation {
        kernel: &'static str,
        #[source]
        source: BackendError,
    },
}

fn removed_reason(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(" (device removed: {reason})"),
        None => String::new(),
    }
}

impl SortError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        SortError::Config {
            reason: reason.into(),
            source: None,
        }
    }

    /// Whether the error was raised before the device was touched.
    pub fn is_config(&self) -> bool {
        matches!(self, SortError::Config { .. })
    }
}

/// Render `err` and every nested cause, one per line, innermost last.
///
/// ```
/// use oems_sort::{error::report, BackendError, SortError};
///
/// let err = SortError::Validation {
///     kernel: "network",
///     source: BackendError::Validation("view slot 0 is unbound".into()),
/// };
/// assert_eq!(
///     report(&err),
///     "- pipeline validation failed before the network dispatch\n\
///      - dispatch validation failed: view slot 0 is unbound\n",
/// );
/// ```
pub fn report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = String::new();
    let mut cause = Some(err);
    while let Some(current) = cause {
        let _ = writeln!(out, "- {current}");
        cause = current.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_chains_io_source() {
        let err = SortError::Config {
            reason: "cannot read kernel source shaders/missing.metal".into(),
            source: Some(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")),
        };
        assert!(err.is_config());
        assert_eq!(err.source().map(|s| s.to_string()), Some("no such file".into()));
        let text = report(&err);
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().last().is_some_and(|l| l.contains("no such file")));
    }

    #[test]
    fn test_device_fault_mentions_reason() {
        let err = SortError::DeviceFault {
            phase: SortPhase::Downloading,
            reason: Some("DEVICE_HUNG".into()),
            source: BackendError::DeviceRemoved,
        };
        assert_eq!(
            err.to_string(),
            "device fault while downloading (device removed: DEVICE_HUNG)"
        );
        assert_eq!(report(&err).lines().last(), Some("- device removed"));
    }
}

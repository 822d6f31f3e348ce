use thiserror::Error;

use retrace_service::error::RepositoryError;
use retrace_service::types::{BacktraceId, ReportId};

/// An error validating or saving a uReport.
///
/// All of these reject the single report they occurred for.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unknown problem type '{0}'")]
    UnknownType(String),
    #[error("malformed report")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid report: {0}")]
    Invalid(String),
    #[error("no crash thread found")]
    NoCrashThread,
    #[error("multiple crash threads found")]
    MultipleCrashThreads,
    #[error("unable to get backtrace hash")]
    NoBacktraceHash,
    /// More than one stored backtrace of the report matches the new backtrace.
    #[error("report {report} matches multiple backtraces: {backtraces:?}")]
    AmbiguousBacktrace {
        report: ReportId,
        backtraces: Vec<BacktraceId>,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ReportError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

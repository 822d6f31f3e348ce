//! Parsing and storing of uReports.

use serde_json::Value;

use retrace_service::config::ProcessingConfig;
use retrace_service::error::RepositoryError;
use retrace_service::repository::RetraceRepository;
use retrace_service::types::{BacktraceHash, BacktraceId, ReportId};

use crate::ProblemType;
use crate::backtrace::find_report_backtrace;
use crate::coredump::{self, CoreReport};
use crate::error::ReportError;
use crate::kerneloops::{self, KerneloopsReport};
use crate::python::{self, PythonReport};

/// A validated problem report.
#[derive(Clone, Debug)]
pub enum UReport {
    Core(CoreReport),
    Python(PythonReport),
    Kerneloops(KerneloopsReport),
}

impl UReport {
    /// Parses and validates the JSON payload of a report.
    pub fn parse(input: &str) -> Result<Self, ReportError> {
        Self::from_value(serde_json::from_str(input)?)
    }

    /// Validates a report, selecting its problem type from the `type` field.
    pub fn from_value(value: Value) -> Result<Self, ReportError> {
        let problem_type: ProblemType = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ReportError::invalid("missing 'type'"))?
            .parse()?;

        let mut report = match problem_type {
            ProblemType::Core => Self::Core(serde_json::from_value(value)?),
            ProblemType::Python => Self::Python(serde_json::from_value(value)?),
            ProblemType::Kerneloops => Self::Kerneloops(serde_json::from_value(value)?),
        };

        match &mut report {
            Self::Core(report) => coredump::validate(report)?,
            Self::Python(report) => python::validate(report)?,
            Self::Kerneloops(report) => kerneloops::validate(report)?,
        }
        Ok(report)
    }

    pub fn problem_type(&self) -> ProblemType {
        match self {
            Self::Core(_) => ProblemType::Core,
            Self::Python(_) => ProblemType::Python,
            Self::Kerneloops(_) => ProblemType::Kerneloops,
        }
    }

    pub fn component(&self) -> &str {
        match self {
            Self::Core(report) => &report.component,
            Self::Python(report) => &report.component,
            Self::Kerneloops(report) => &report.component,
        }
    }

    /// The hash identifying duplicate reports.
    pub fn hash(&self, hash_frames: usize) -> Result<String, ReportError> {
        match self {
            Self::Core(report) => coredump::hash_ureport(report, hash_frames),
            Self::Python(report) => Ok(python::hash_ureport(report, hash_frames)),
            Self::Kerneloops(report) => Ok(kerneloops::hash_ureport(report, hash_frames)),
        }
    }

    /// The hashes identifying duplicate backtraces.
    pub fn backtrace_hashes(&self) -> Vec<BacktraceHash> {
        match self {
            Self::Core(report) => coredump::hash_backtrace(report),
            Self::Python(report) => python::hash_backtrace(report),
            Self::Kerneloops(report) => kerneloops::hash_backtrace(report),
        }
    }

    /// The function the crash happened in, as reported by the client.
    pub fn crash_function(&self) -> Option<String> {
        match self {
            Self::Core(report) => coredump::crash_function(report),
            Self::Python(report) => python::crash_function(report),
            Self::Kerneloops(report) => kerneloops::crash_function(report),
        }
    }

    fn save_threads(
        &self,
        repo: &mut dyn RetraceRepository,
        backtrace: BacktraceId,
    ) -> Result<(), RepositoryError> {
        match self {
            Self::Core(report) => coredump::save_threads(repo, backtrace, report),
            Self::Python(report) => python::save_threads(repo, backtrace, report),
            Self::Kerneloops(report) => kerneloops::save_threads(repo, backtrace, report),
        }
    }
}

/// Stores `count` occurrences of `report`.
///
/// Reports are deduplicated by their report hash. A duplicate report keeps its backtrace if one
/// of the new backtrace hashes matches. Otherwise a new backtrace is stored along with all of
/// its threads, frames and unresolved symbol sources.
pub fn save_ureport(
    repo: &mut dyn RetraceRepository,
    config: &ProcessingConfig,
    report: &UReport,
    count: u64,
) -> Result<ReportId, ReportError> {
    let problem_type = report.problem_type();
    let hashes = report.backtrace_hashes();
    if hashes.is_empty() {
        return Err(ReportError::NoBacktraceHash);
    }
    let hash = report.hash(config.hash_frames)?;

    let (report_id, backtrace) = match repo.find_report_by_hash(problem_type.name(), &hash)? {
        Some(existing) => {
            let backtrace = find_report_backtrace(repo, existing.id, &hashes)?;
            (existing.id, backtrace)
        }
        None => {
            tracing::debug!("Creating {} report for '{}'", problem_type, report.component());
            let id = repo.create_report(problem_type.name(), report.component(), &hash)?;
            (id, None)
        }
    };
    repo.bump_report_count(report_id, count)?;

    if backtrace.is_none() {
        let backtrace = repo.create_backtrace(report_id, hashes, report.crash_function())?;
        report.save_threads(repo, backtrace)?;
        tracing::debug!("Saved backtrace {} of report {}", backtrace, report_id);
    }

    Ok(report_id)
}

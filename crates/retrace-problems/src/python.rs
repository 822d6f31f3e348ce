//! Unhandled Python exceptions.
//!
//! Tracebacks carry function names and source locations, so their symbol sources are stored
//! resolved and never retraced.

use serde::{Deserialize, Serialize};

use retrace_service::error::RepositoryError;
use retrace_service::repository::{NewSymbolSource, RetraceRepository};
use retrace_service::types::{BacktraceHash, BacktraceId, HashKind, SymbolSourceKey};

use crate::backtrace::{ThreadWriter, find_or_save_symbol, find_or_save_symbol_source};
use crate::error::ReportError;
use crate::hashing::hash_list;

const MODULE_FUNCTION: &str = "<module>";

/// The payload of a `python` uReport.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PythonReport {
    pub component: String,
    pub exception_name: String,
    /// Innermost frame first.
    pub traceback: Vec<PythonFrame>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PythonFrame {
    pub file_name: String,
    pub file_line: u32,
    pub is_module: bool,
    pub line_contents: String,
    pub function_name: Option<String>,
}

impl PythonFrame {
    fn function(&self) -> &str {
        if self.is_module {
            MODULE_FUNCTION
        } else {
            self.function_name.as_deref().unwrap_or_default()
        }
    }

    fn location(&self) -> String {
        format!("{} @ {} + {}", self.function(), self.file_name, self.file_line)
    }
}

pub fn validate(report: &mut PythonReport) -> Result<(), ReportError> {
    if report.exception_name.is_empty() {
        return Err(ReportError::invalid("'exception_name' must not be empty"));
    }
    if report.component.is_empty() {
        return Err(ReportError::invalid("'component' must not be empty"));
    }
    if report.traceback.is_empty() {
        return Err(ReportError::invalid("'traceback' must not be empty"));
    }
    for frame in &report.traceback {
        if !frame.is_module && frame.function_name.is_none() {
            return Err(ReportError::invalid(format!(
                "frame at {}:{} has no 'function_name'",
                frame.file_name, frame.file_line
            )));
        }
    }
    Ok(())
}

/// Hashes the component and the first `hash_frames` frames.
pub fn hash_ureport(report: &PythonReport, hash_frames: usize) -> String {
    let frames = report.traceback.iter().take(hash_frames).map(PythonFrame::location);
    hash_list(std::iter::once(report.component.clone()).chain(frames))
}

/// Hashes the exception and the whole traceback.
pub fn hash_backtrace(report: &PythonReport) -> Vec<BacktraceHash> {
    let frames = report.traceback.iter().map(PythonFrame::location);
    let hash = hash_list(std::iter::once(report.exception_name.clone()).chain(frames));
    vec![BacktraceHash::new(HashKind::Names, hash)]
}

pub fn crash_function(report: &PythonReport) -> Option<String> {
    report.traceback.first().map(|frame| frame.function().to_owned())
}

/// Stores the traceback as the single crash thread of `backtrace`.
pub fn save_threads(
    repo: &mut dyn RetraceRepository,
    backtrace: BacktraceId,
    report: &PythonReport,
) -> Result<(), RepositoryError> {
    let mut writer = ThreadWriter::new(repo, backtrace, 1, true)?;

    for frame in &report.traceback {
        let symbol = find_or_save_symbol(repo, frame.function(), &frame.file_name)?;
        let key = SymbolSourceKey::new(None, frame.file_name.as_str(), i64::from(frame.file_line));
        let ssource = find_or_save_symbol_source(
            repo,
            NewSymbolSource {
                symbol: Some(symbol),
                source_path: Some(frame.file_name.clone()),
                line_number: Some(frame.file_line),
                ..NewSymbolSource::new(key)
            },
        )?;
        writer.push(repo, ssource, true)?;
    }
    Ok(())
}

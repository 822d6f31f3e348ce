//! Problem types of uReports: validation, hashing, saving, retracing and clustering.
//!
//! Every report declares its type by name. The name selects one of the [`ProblemType`]s, which
//! know how to interpret the rest of the payload.

use std::fmt;
use std::str::FromStr;

pub mod backtrace;
pub mod cluster;
pub mod coredump;
pub mod error;
pub mod hashing;
pub mod kerneloops;
pub mod python;
pub mod retrace;
pub mod ureport;

pub use error::ReportError;
pub use ureport::{UReport, save_ureport};

/// The kinds of problems reported by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProblemType {
    /// A crash of a user-space binary.
    Core,
    /// An unhandled Python exception.
    Python,
    /// A kernel oops.
    Kerneloops,
}

impl ProblemType {
    pub const ALL: [ProblemType; 3] = [Self::Core, Self::Python, Self::Kerneloops];

    /// The name used in uReports and storage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Python => "python",
            Self::Kerneloops => "kerneloops",
        }
    }

    pub fn nice_name(&self) -> &'static str {
        match self {
            Self::Core => "Crash of user-space binary",
            Self::Python => "Unhandled Python exception",
            Self::Kerneloops => "Kernel oops",
        }
    }

    /// Whether symbol sources of this type need to be resolved from debuginfo.
    ///
    /// Python tracebacks carry function names and source locations already.
    pub fn needs_retrace(&self) -> bool {
        !matches!(self, Self::Python)
    }
}

impl FromStr for ProblemType {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ReportError::UnknownType(s.to_owned()))
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::types::{PackageKind, SymbolSourceId};

/// An error running one of the external debug or packaging tools.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be started at all, e.g. because it is not installed.
    #[error("failed to execute {tool}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    /// Waiting for the tool or reading its output failed.
    #[error("failed waiting for {tool}")]
    Wait {
        tool: String,
        #[source]
        source: io::Error,
    },
    /// The tool exited with a non-zero status.
    ///
    /// The attached string contains whatever the tool printed to stderr.
    #[error("{tool} failed with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    /// The tool did not finish in time and was killed.
    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
}

/// An error unpacking a package to a temporary directory.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// The temporary directory could not be created.
    ///
    /// This usually means that the disk is full or the temp directory is not writable, which
    /// affects every other package as well.
    #[error("failed to create unpack directory in {}", .0.display())]
    TempDir(PathBuf, #[source] io::Error),
    /// The package file does not exist or cannot be read.
    #[error("cannot read package '{0}'")]
    Unreadable(String, #[source] io::Error),
    /// The extraction tools failed.
    #[error("failed to unpack '{nvra}'")]
    Extract {
        nvra: String,
        #[source]
        source: ToolError,
    },
    /// Extraction did not finish within the timeout.
    #[error("unpacking '{nvra}' timed out after {timeout:?}")]
    Timeout { nvra: String, timeout: Duration },
    /// No unpacker exists for this kind of package.
    #[error("unsupported package type {0:?}")]
    Unsupported(PackageKind),
}

impl UnpackError {
    /// Whether this error affects every package and the run should be aborted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TempDir(..))
    }
}

/// An error resolving an address to a function name.
///
/// These are never fatal: the symbol source stays unresolved and is picked up again by a later
/// retrace run.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// `eu-unstrip` printed something that does not start with a base address.
    #[error("unexpected output from eu-unstrip: '{0}'")]
    MalformedBaseAddress(String),
    /// `eu-addr2line` printed something that does not follow the two line grammar.
    #[error("unexpected output from eu-addr2line: '{0}'")]
    MalformedAddr2Line(String),
    /// All attempts resolved to `??`.
    #[error("eu-addr2line cannot find function name")]
    FunctionNotFound,
    /// The function is not part of the kernel module's symbol table.
    #[error("function '{function}' not found in module '{module}'")]
    KernelSymbolNotFound { module: String, function: String },
}

/// An error locating the packages needed to retrace a symbol source.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("no debuginfo package provides '{0}'")]
    DebuginfoNotFound(String),
    #[error("matching binary package not found for '{0}'")]
    BinaryNotFound(String),
    #[error("symbol source {0} has no build id")]
    MissingBuildId(SymbolSourceId),
    #[error("unable to determine {what} from '{input}'")]
    KernelVersion { what: &'static str, input: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// An error reported by the storage backend.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// An error processing one retrace task.
#[derive(Debug, Error)]
pub enum RetraceError {
    /// A package of the task has no stored file and cannot be unpacked.
    #[error("package file for {0} not found in storage")]
    IncompleteTask(String),
    #[error(transparent)]
    Unpack(#[from] UnpackError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to start retrace workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl RetraceError {
    /// Whether the whole retrace run has to be aborted.
    ///
    /// Everything else abandons just the current task (or symbol) and leaves the remaining
    /// symbol sources unresolved for a future run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unpack(err) => err.is_fatal(),
            Self::Io(_) | Self::ThreadPool(_) => true,
            Self::IncompleteTask(_) | Self::Repository(_) => false,
        }
    }
}

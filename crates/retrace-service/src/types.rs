//! The retrace data model.
//!
//! These are plain values. The storage backend hands them out through the
//! [`RetraceRepository`](crate::repository::RetraceRepository) and never gives away live handles,
//! so every type here can be moved across threads freely.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "#{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a [`Symbol`].
    SymbolId
);
id_type!(
    /// Identifies a [`SymbolSource`].
    SymbolSourceId
);
id_type!(
    /// Identifies a [`Package`].
    PackageId
);
id_type!(
    /// Identifies the build a package was produced by.
    ///
    /// All packages of one build (binary, debuginfo, source) share this id.
    BuildId
);
id_type!(ReportId);
id_type!(BacktraceId);
id_type!(ThreadId);
id_type!(FrameId);
id_type!(ProblemId);

/// The format of a package file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PackageKind {
    Rpm,
    Deb,
}

impl FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rpm" => Ok(Self::Rpm),
            "deb" => Ok(Self::Deb),
            other => Err(format!("unknown package type '{other}'")),
        }
    }
}

/// A package known to the storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub epoch: u32,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub build: BuildId,
    pub kind: PackageKind,
    /// Location of the package file, if the package has been downloaded.
    pub lob_path: Option<PathBuf>,
}

impl Package {
    /// Returns the Name-Version-Release-Architecture string of this package.
    pub fn nvra(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.name, self.version, self.release, self.arch
        )
    }
}

/// A resolved function identity, independent of where it is used.
///
/// Unique by `(name, normalized_path)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    /// The demangled name, if it differs from `name`.
    pub nice_name: Option<String>,
    /// The library name (see [`libname`](crate::utils::paths::libname)) or kernel module.
    pub normalized_path: String,
}

/// The unique key of a [`SymbolSource`].
///
/// Functions that only exist as an inlined body have no offset of their own. Their symbol
/// sources are keyed by a negative offset derived from the source line instead, see
/// [`new_inlined`](Self::new_inlined).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolSourceKey {
    pub build_id: Option<String>,
    pub path: String,
    pub offset: i64,
}

impl SymbolSourceKey {
    pub fn new(build_id: Option<String>, path: impl Into<String>, offset: i64) -> Self {
        Self {
            build_id,
            path: path.into(),
            offset,
        }
    }

    /// Creates the key of a function inlined at `line` of the binary at `path`.
    ///
    /// The offset is `-(line + 1)`, which stays negative for unknown lines reported as `0`.
    pub fn new_inlined(build_id: Option<String>, path: impl Into<String>, line: u32) -> Self {
        Self::new(build_id, path, -(i64::from(line) + 1))
    }

    /// Whether this key was created by [`new_inlined`](Self::new_inlined).
    ///
    /// Kernel addresses at the top of the address space are stored as negative offsets as well,
    /// so this is only meaningful for user space binaries.
    pub fn is_inlined(&self) -> bool {
        self.offset < 0
    }

    /// Returns the same key with a different path.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self::new(self.build_id.clone(), path, self.offset)
    }
}

impl fmt::Display for SymbolSourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let build_id = self.build_id.as_deref().unwrap_or("-");
        write!(f, "{}:{}+{:#x}", build_id, self.path, self.offset)
    }
}

/// One occurrence of a symbol at a specific binary location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolSource {
    pub id: SymbolSourceId,
    pub key: SymbolSourceKey,
    pub symbol: Option<SymbolId>,
    /// Offset into the function, known for kernel frames.
    pub func_offset: i64,
    /// Client-side fingerprint of the frame.
    pub hash: Option<String>,
    pub source_path: Option<String>,
    pub line_number: Option<u32>,
    pub retrace_fail_count: u32,
}

impl SymbolSource {
    /// Whether function, source file and line are all known.
    pub fn is_resolved(&self) -> bool {
        self.symbol.is_some() && self.source_path.is_some() && self.line_number.is_some()
    }

    /// The offset reinterpreted as an unsigned address.
    ///
    /// Kernel addresses that do not fit into a signed 64-bit integer are stored wrapped.
    pub fn address(&self) -> u64 {
        self.key.offset as u64
    }

    pub fn build_id(&self) -> Option<&str> {
        self.key.build_id.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }
}

/// One entry of `eu-addr2line` output: a function and the source location within it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub function: String,
    pub source_file: String,
    pub line: u32,
}

impl ResolvedFrame {
    pub fn new(function: impl Into<String>, source_file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            source_file: source_file.into(),
            line,
        }
    }
}

/// A frame of a stored backtrace thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportBtFrame {
    pub id: FrameId,
    pub thread: ThreadId,
    /// Dense, 1-based position in the thread. Frame 1 is the innermost frame.
    pub order: u32,
    pub symbol_source: SymbolSourceId,
    /// Set for frames synthesized from inlined functions during retracing.
    pub inlined: bool,
    pub reliable: bool,
}

/// A thread of a stored backtrace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportBtThread {
    pub id: ThreadId,
    pub backtrace: BacktraceId,
    pub number: u32,
    pub crash_thread: bool,
}

/// The strategy used to compute a backtrace hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashKind {
    /// Hashed by function names.
    Names,
    /// Hashed by client-side frame fingerprints.
    Fingerprints,
    /// Hashed by build id offsets.
    Offsets,
}

impl HashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Names => "NAMES",
            Self::Fingerprints => "FINGERPRINTS",
            Self::Offsets => "OFFSETS",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content hash of a backtrace, used as a deduplication key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BacktraceHash {
    pub kind: HashKind,
    pub hash: String,
}

impl BacktraceHash {
    pub fn new(kind: HashKind, hash: impl Into<String>) -> Self {
        Self {
            kind,
            hash: hash.into(),
        }
    }
}

/// A stored backtrace of a report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportBacktrace {
    pub id: BacktraceId,
    pub report: ReportId,
    pub hashes: Vec<BacktraceHash>,
    pub crash_function: Option<String>,
}

/// A stored report, deduplicated by its report hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub id: ReportId,
    pub problem_type: String,
    pub component: String,
    pub hash: String,
    pub count: u64,
    pub problem: Option<ProblemId>,
}

/// A cluster of reports judged to be the same underlying defect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Problem {
    pub id: ProblemId,
    pub crash_function: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inlined_key() {
        let key = SymbolSourceKey::new_inlined(Some("abcd".into()), "/usr/bin/foo", 42);
        assert_eq!(key.offset, -43);
        assert!(key.is_inlined());

        let key = SymbolSourceKey::new_inlined(Some("abcd".into()), "/usr/bin/foo", 0);
        assert_eq!(key.offset, -1);
        assert!(key.is_inlined());

        let key = SymbolSourceKey::new(Some("abcd".into()), "/usr/bin/foo", 42);
        assert!(!key.is_inlined());
    }

    #[test]
    fn test_nvra() {
        let package = Package {
            id: PackageId(1),
            name: "coreutils".into(),
            epoch: 0,
            version: "9.4".into(),
            release: "3.fc40".into(),
            arch: "x86_64".into(),
            build: BuildId(1),
            kind: PackageKind::Rpm,
            lob_path: None,
        };
        assert_eq!(package.nvra(), "coreutils-9.4-3.fc40.x86_64");
    }

    #[test]
    fn test_kernel_address_roundtrip() {
        let address: u64 = 0xffff_ffff_8100_0000;
        let ssource = SymbolSource {
            id: SymbolSourceId(1),
            key: SymbolSourceKey::new(Some("3.10.0-3.fc19.x86_64".into()), "vmlinux", address as i64),
            symbol: None,
            func_offset: 0,
            hash: None,
            source_path: None,
            line_number: None,
            retrace_fail_count: 0,
        };
        assert_eq!(ssource.address(), address);
    }
}

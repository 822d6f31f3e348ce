//! Access to the persistent storage of packages, symbols and reports.
//!
//! The retrace pipeline never talks to a database directly. Everything it reads or writes goes
//! through [`RetraceRepository`], which is implemented by the storage layer. The trait takes
//! `&mut self` for every write, which together with the single consumer of the
//! [`RetracePool`](crate::pool::RetracePool) guarantees that writes are never issued
//! concurrently.
//!
//! [`MemoryRepository`] is a complete in-process implementation.

mod memory;

pub use memory::MemoryRepository;

use crate::error::RepositoryError;
use crate::types::{
    BacktraceHash, BacktraceId, BuildId, FrameId, Package, PackageId, Problem, ProblemId, Report,
    ReportBacktrace, ReportBtFrame, ReportBtThread, ReportId, Symbol, SymbolId, SymbolSource,
    SymbolSourceId, SymbolSourceKey, ThreadId,
};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A frame to be inserted into a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFrame {
    pub thread: ThreadId,
    pub order: u32,
    pub symbol_source: SymbolSourceId,
    pub inlined: bool,
    pub reliable: bool,
}

/// A new, not yet resolved symbol source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSymbolSource {
    pub key: SymbolSourceKey,
    pub symbol: Option<SymbolId>,
    pub func_offset: i64,
    pub hash: Option<String>,
    pub source_path: Option<String>,
    pub line_number: Option<u32>,
}

impl NewSymbolSource {
    pub fn new(key: SymbolSourceKey) -> Self {
        Self {
            key,
            symbol: None,
            func_offset: 0,
            hash: None,
            source_path: None,
            line_number: None,
        }
    }
}

/// The storage interface consumed by the retrace pipeline and the problem types.
pub trait RetraceRepository {
    // packages

    fn package(&self, id: PackageId) -> RepositoryResult<Package>;

    /// Returns all packages providing the file at `path`.
    fn find_debuginfo_providers(&self, path: &str) -> RepositoryResult<Vec<Package>>;

    /// Returns the package of `build` and `arch` providing the file at `path`.
    fn find_binary_provider(
        &self,
        build: BuildId,
        arch: &str,
        path: &str,
    ) -> RepositoryResult<Option<Package>>;

    /// Returns the source package of `build`.
    fn find_source_package(&self, build: BuildId) -> RepositoryResult<Option<Package>>;

    fn find_package_by_nevra(
        &self,
        name: &str,
        epoch: u32,
        version: &str,
        release: &str,
        arch: &str,
    ) -> RepositoryResult<Option<Package>>;

    fn find_package_by_name_build_arch(
        &self,
        name: &str,
        build: BuildId,
        arch: &str,
    ) -> RepositoryResult<Option<Package>>;

    /// Returns the names of all architectures known to the storage.
    fn known_archs(&self) -> RepositoryResult<Vec<String>>;

    /// Returns the kernel debug files (`vmlinux` and `*.ko.debug`) of a debuginfo package.
    fn debug_files(&self, package: PackageId) -> RepositoryResult<Vec<String>>;

    /// Returns the file of `package` whose file name is exactly `name`.
    fn find_package_file(&self, package: PackageId, name: &str)
    -> RepositoryResult<Option<String>>;

    // symbols

    fn symbol(&self, id: SymbolId) -> RepositoryResult<Symbol>;

    fn find_symbol(&self, name: &str, normalized_path: &str) -> RepositoryResult<Option<Symbol>>;

    /// Stores a new symbol. Fails with [`RepositoryError::Conflict`] if it already exists.
    fn save_symbol(
        &mut self,
        name: &str,
        nice_name: Option<&str>,
        normalized_path: &str,
    ) -> RepositoryResult<SymbolId>;

    fn set_symbol_nice_name(&mut self, id: SymbolId, nice_name: &str) -> RepositoryResult<()>;

    // symbol sources

    fn symbol_source(&self, id: SymbolSourceId) -> RepositoryResult<SymbolSource>;

    fn find_symbol_source(&self, key: &SymbolSourceKey) -> RepositoryResult<Option<SymbolSource>>;

    /// Returns the unresolved symbol sources referenced by reports of `problem_type`.
    ///
    /// With `max_fail_count`, sources that failed to retrace more often are left out.
    fn unresolved_symbol_sources(
        &self,
        problem_type: &str,
        max_fail_count: Option<u32>,
    ) -> RepositoryResult<Vec<SymbolSource>>;

    /// Stores a new symbol source. Fails with [`RepositoryError::Conflict`] if the key exists.
    fn save_symbol_source(&mut self, ssource: NewSymbolSource)
    -> RepositoryResult<SymbolSourceId>;

    /// Marks a symbol source as resolved to `symbol` at `source_path:line`.
    fn resolve_symbol_source(
        &mut self,
        id: SymbolSourceId,
        symbol: SymbolId,
        source_path: &str,
        line: u32,
    ) -> RepositoryResult<()>;

    /// Changes the path of a symbol source.
    ///
    /// Fails with [`RepositoryError::Conflict`] if the new key is taken already.
    fn update_symbol_source_path(&mut self, id: SymbolSourceId, path: &str)
    -> RepositoryResult<()>;

    /// Repoints all frames referencing `from` to `to` and deletes `from`.
    fn merge_symbol_source(
        &mut self,
        from: SymbolSourceId,
        to: SymbolSourceId,
    ) -> RepositoryResult<()>;

    fn record_retrace_failure(&mut self, id: SymbolSourceId) -> RepositoryResult<()>;

    /// Deletes all symbol sources not referenced by any frame. Returns the number of deletions.
    fn delete_orphan_symbol_sources(&mut self) -> RepositoryResult<usize>;

    // frames

    fn frames_for_symbol_source(&self, id: SymbolSourceId)
    -> RepositoryResult<Vec<ReportBtFrame>>;

    /// Returns the frames of `thread`, ordered by `order`.
    fn thread_frames(&self, thread: ThreadId) -> RepositoryResult<Vec<ReportBtFrame>>;

    /// Inserts a frame. The caller is responsible for making room at `order`.
    fn insert_frame(&mut self, frame: NewFrame) -> RepositoryResult<FrameId>;

    /// Adds `delta` to the order of every frame of `thread` at or after `from_order`.
    fn shift_frame_orders(
        &mut self,
        thread: ThreadId,
        from_order: u32,
        delta: u32,
    ) -> RepositoryResult<()>;

    // reports and backtraces

    fn report(&self, id: ReportId) -> RepositoryResult<Report>;

    fn find_report_by_hash(
        &self,
        problem_type: &str,
        hash: &str,
    ) -> RepositoryResult<Option<Report>>;

    fn create_report(
        &mut self,
        problem_type: &str,
        component: &str,
        hash: &str,
    ) -> RepositoryResult<ReportId>;

    fn bump_report_count(&mut self, id: ReportId, count: u64) -> RepositoryResult<()>;

    fn reports_of_type(&self, problem_type: &str) -> RepositoryResult<Vec<Report>>;

    fn backtrace(&self, id: BacktraceId) -> RepositoryResult<ReportBacktrace>;

    /// Returns all backtraces which recorded a hash equal to `hash` of the same kind.
    fn backtraces_by_hash(&self, hash: &BacktraceHash) -> RepositoryResult<Vec<BacktraceId>>;

    fn create_backtrace(
        &mut self,
        report: ReportId,
        hashes: Vec<BacktraceHash>,
        crash_function: Option<String>,
    ) -> RepositoryResult<BacktraceId>;

    fn create_thread(
        &mut self,
        backtrace: BacktraceId,
        number: u32,
        crash_thread: bool,
    ) -> RepositoryResult<ThreadId>;

    fn report_backtraces(&self, report: ReportId) -> RepositoryResult<Vec<ReportBacktrace>>;

    fn backtrace_threads(&self, backtrace: BacktraceId) -> RepositoryResult<Vec<ReportBtThread>>;

    // problems

    fn problems(&self) -> RepositoryResult<Vec<Problem>>;

    fn problem_reports(&self, problem: ProblemId) -> RepositoryResult<Vec<ReportId>>;

    fn create_problem(&mut self) -> RepositoryResult<ProblemId>;

    fn delete_problem(&mut self, problem: ProblemId) -> RepositoryResult<()>;

    fn assign_report_problem(&mut self, report: ReportId, problem: ProblemId)
    -> RepositoryResult<()>;

    fn set_problem_crash_function(
        &mut self,
        problem: ProblemId,
        crash_function: Option<String>,
    ) -> RepositoryResult<()>;
}

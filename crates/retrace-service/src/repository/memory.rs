use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::{NewFrame, NewSymbolSource, RepositoryResult, RetraceRepository};
use crate::error::RepositoryError;
use crate::types::{
    BacktraceHash, BacktraceId, BuildId, FrameId, Package, PackageId, PackageKind, Problem,
    ProblemId, Report, ReportBacktrace, ReportBtFrame, ReportBtThread, ReportId, Symbol, SymbolId,
    SymbolSource, SymbolSourceId, SymbolSourceKey, ThreadId,
};

/// A [`RetraceRepository`] keeping everything in memory.
///
/// All uniqueness rules of the storage are enforced, so writes that would violate them fail with
/// [`RepositoryError::Conflict`] just like they would against a database.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    last_id: u64,
    packages: BTreeMap<PackageId, Package>,
    provides: BTreeMap<PackageId, BTreeSet<String>>,
    symbols: BTreeMap<SymbolId, Symbol>,
    symbol_sources: BTreeMap<SymbolSourceId, SymbolSource>,
    frames: BTreeMap<FrameId, ReportBtFrame>,
    threads: BTreeMap<ThreadId, ReportBtThread>,
    backtraces: BTreeMap<BacktraceId, ReportBacktrace>,
    reports: BTreeMap<ReportId, Report>,
    problems: BTreeMap<ProblemId, Problem>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Allocates a new build.
    pub fn new_build(&mut self) -> BuildId {
        BuildId(self.next_id())
    }

    /// Adds an RPM package without a package file.
    pub fn add_package(
        &mut self,
        name: &str,
        version: &str,
        release: &str,
        arch: &str,
        build: BuildId,
    ) -> PackageId {
        let id = PackageId(self.next_id());
        self.packages.insert(
            id,
            Package {
                id,
                name: name.to_owned(),
                epoch: 0,
                version: version.to_owned(),
                release: release.to_owned(),
                arch: arch.to_owned(),
                build,
                kind: PackageKind::Rpm,
                lob_path: None,
            },
        );
        id
    }

    /// Sets the location of the package file.
    pub fn set_package_file(&mut self, id: PackageId, path: impl Into<PathBuf>) {
        if let Some(package) = self.packages.get_mut(&id) {
            package.lob_path = Some(path.into());
        }
    }

    /// Records that `package` provides the given files.
    pub fn add_provides(&mut self, package: PackageId, files: &[&str]) {
        let provides = self.provides.entry(package).or_default();
        provides.extend(files.iter().map(|file| file.to_string()));
    }

    /// Returns all symbol sources, ordered by id.
    pub fn symbol_sources(&self) -> Vec<SymbolSource> {
        self.symbol_sources.values().cloned().collect()
    }

    /// Returns all symbols, ordered by id.
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.values().cloned().collect()
    }

    fn provides(&self, package: PackageId, path: &str) -> bool {
        self.provides
            .get(&package)
            .is_some_and(|files| files.contains(path))
    }

    fn find_key(&self, key: &SymbolSourceKey) -> Option<&SymbolSource> {
        self.symbol_sources.values().find(|ssource| ssource.key == *key)
    }

    fn symbol_source_mut(&mut self, id: SymbolSourceId) -> RepositoryResult<&mut SymbolSource> {
        self.symbol_sources
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("symbol source {id}")))
    }

    fn report_type_of_thread(&self, thread: ThreadId) -> Option<&str> {
        let thread = self.threads.get(&thread)?;
        let backtrace = self.backtraces.get(&thread.backtrace)?;
        let report = self.reports.get(&backtrace.report)?;
        Some(&report.problem_type)
    }
}

impl RetraceRepository for MemoryRepository {
    fn package(&self, id: PackageId) -> RepositoryResult<Package> {
        self.packages
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("package {id}")))
    }

    fn find_debuginfo_providers(&self, path: &str) -> RepositoryResult<Vec<Package>> {
        Ok(self
            .packages
            .values()
            .filter(|package| self.provides(package.id, path))
            .cloned()
            .collect())
    }

    fn find_binary_provider(
        &self,
        build: BuildId,
        arch: &str,
        path: &str,
    ) -> RepositoryResult<Option<Package>> {
        Ok(self
            .packages
            .values()
            .find(|package| {
                package.build == build && package.arch == arch && self.provides(package.id, path)
            })
            .cloned())
    }

    fn find_source_package(&self, build: BuildId) -> RepositoryResult<Option<Package>> {
        Ok(self
            .packages
            .values()
            .find(|package| package.build == build && package.arch == "src")
            .cloned())
    }

    fn find_package_by_nevra(
        &self,
        name: &str,
        epoch: u32,
        version: &str,
        release: &str,
        arch: &str,
    ) -> RepositoryResult<Option<Package>> {
        Ok(self
            .packages
            .values()
            .find(|package| {
                package.name == name
                    && package.epoch == epoch
                    && package.version == version
                    && package.release == release
                    && package.arch == arch
            })
            .cloned())
    }

    fn find_package_by_name_build_arch(
        &self,
        name: &str,
        build: BuildId,
        arch: &str,
    ) -> RepositoryResult<Option<Package>> {
        Ok(self
            .packages
            .values()
            .find(|package| package.name == name && package.build == build && package.arch == arch)
            .cloned())
    }

    fn known_archs(&self) -> RepositoryResult<Vec<String>> {
        let archs: BTreeSet<_> = self.packages.values().map(|p| p.arch.clone()).collect();
        Ok(archs.into_iter().collect())
    }

    fn debug_files(&self, package: PackageId) -> RepositoryResult<Vec<String>> {
        let Some(files) = self.provides.get(&package) else {
            return Ok(Vec::new());
        };
        Ok(files
            .iter()
            .filter(|file| file.ends_with(".ko.debug") || file.ends_with("/vmlinux"))
            .cloned()
            .collect())
    }

    fn find_package_file(
        &self,
        package: PackageId,
        name: &str,
    ) -> RepositoryResult<Option<String>> {
        let suffix = format!("/{name}");
        Ok(self.provides.get(&package).and_then(|files| {
            files
                .iter()
                .find(|file| file.starts_with('/') && file.ends_with(&suffix))
                .cloned()
        }))
    }

    fn symbol(&self, id: SymbolId) -> RepositoryResult<Symbol> {
        self.symbols
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("symbol {id}")))
    }

    fn find_symbol(&self, name: &str, normalized_path: &str) -> RepositoryResult<Option<Symbol>> {
        Ok(self
            .symbols
            .values()
            .find(|symbol| symbol.name == name && symbol.normalized_path == normalized_path)
            .cloned())
    }

    fn save_symbol(
        &mut self,
        name: &str,
        nice_name: Option<&str>,
        normalized_path: &str,
    ) -> RepositoryResult<SymbolId> {
        if self.find_symbol(name, normalized_path)?.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "symbol '{name}' @ '{normalized_path}'"
            )));
        }
        let id = SymbolId(self.next_id());
        self.symbols.insert(
            id,
            Symbol {
                id,
                name: name.to_owned(),
                nice_name: nice_name.map(str::to_owned),
                normalized_path: normalized_path.to_owned(),
            },
        );
        Ok(id)
    }

    fn set_symbol_nice_name(&mut self, id: SymbolId, nice_name: &str) -> RepositoryResult<()> {
        let symbol = self
            .symbols
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("symbol {id}")))?;
        symbol.nice_name = Some(nice_name.to_owned());
        Ok(())
    }

    fn symbol_source(&self, id: SymbolSourceId) -> RepositoryResult<SymbolSource> {
        self.symbol_sources
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("symbol source {id}")))
    }

    fn find_symbol_source(&self, key: &SymbolSourceKey) -> RepositoryResult<Option<SymbolSource>> {
        Ok(self.find_key(key).cloned())
    }

    fn unresolved_symbol_sources(
        &self,
        problem_type: &str,
        max_fail_count: Option<u32>,
    ) -> RepositoryResult<Vec<SymbolSource>> {
        let referenced: BTreeSet<_> = self
            .frames
            .values()
            .filter(|frame| self.report_type_of_thread(frame.thread) == Some(problem_type))
            .map(|frame| frame.symbol_source)
            .collect();

        Ok(referenced
            .into_iter()
            .filter_map(|id| self.symbol_sources.get(&id))
            .filter(|ssource| !ssource.is_resolved())
            .filter(|ssource| max_fail_count.is_none_or(|max| ssource.retrace_fail_count <= max))
            .cloned()
            .collect())
    }

    fn save_symbol_source(
        &mut self,
        ssource: NewSymbolSource,
    ) -> RepositoryResult<SymbolSourceId> {
        if self.find_key(&ssource.key).is_some() {
            return Err(RepositoryError::Conflict(format!(
                "symbol source {}",
                ssource.key
            )));
        }
        let id = SymbolSourceId(self.next_id());
        self.symbol_sources.insert(
            id,
            SymbolSource {
                id,
                key: ssource.key,
                symbol: ssource.symbol,
                func_offset: ssource.func_offset,
                hash: ssource.hash,
                source_path: ssource.source_path,
                line_number: ssource.line_number,
                retrace_fail_count: 0,
            },
        );
        Ok(id)
    }

    fn resolve_symbol_source(
        &mut self,
        id: SymbolSourceId,
        symbol: SymbolId,
        source_path: &str,
        line: u32,
    ) -> RepositoryResult<()> {
        if !self.symbols.contains_key(&symbol) {
            return Err(RepositoryError::NotFound(format!("symbol {symbol}")));
        }
        let ssource = self.symbol_source_mut(id)?;
        ssource.symbol = Some(symbol);
        ssource.source_path = Some(source_path.to_owned());
        ssource.line_number = Some(line);
        Ok(())
    }

    fn update_symbol_source_path(
        &mut self,
        id: SymbolSourceId,
        path: &str,
    ) -> RepositoryResult<()> {
        let key = self.symbol_source(id)?.key.with_path(path);
        if let Some(existing) = self.find_key(&key) {
            if existing.id != id {
                return Err(RepositoryError::Conflict(format!("symbol source {key}")));
            }
        }
        self.symbol_source_mut(id)?.key = key;
        Ok(())
    }

    fn merge_symbol_source(
        &mut self,
        from: SymbolSourceId,
        to: SymbolSourceId,
    ) -> RepositoryResult<()> {
        if !self.symbol_sources.contains_key(&to) {
            return Err(RepositoryError::NotFound(format!("symbol source {to}")));
        }
        if self.symbol_sources.remove(&from).is_none() {
            return Err(RepositoryError::NotFound(format!("symbol source {from}")));
        }
        for frame in self.frames.values_mut() {
            if frame.symbol_source == from {
                frame.symbol_source = to;
            }
        }
        Ok(())
    }

    fn record_retrace_failure(&mut self, id: SymbolSourceId) -> RepositoryResult<()> {
        self.symbol_source_mut(id)?.retrace_fail_count += 1;
        Ok(())
    }

    fn delete_orphan_symbol_sources(&mut self) -> RepositoryResult<usize> {
        let referenced: BTreeSet<_> = self.frames.values().map(|f| f.symbol_source).collect();
        let before = self.symbol_sources.len();
        self.symbol_sources.retain(|id, _| referenced.contains(id));
        Ok(before - self.symbol_sources.len())
    }

    fn frames_for_symbol_source(
        &self,
        id: SymbolSourceId,
    ) -> RepositoryResult<Vec<ReportBtFrame>> {
        Ok(self
            .frames
            .values()
            .filter(|frame| frame.symbol_source == id)
            .cloned()
            .collect())
    }

    fn thread_frames(&self, thread: ThreadId) -> RepositoryResult<Vec<ReportBtFrame>> {
        let mut frames: Vec<_> = self
            .frames
            .values()
            .filter(|frame| frame.thread == thread)
            .cloned()
            .collect();
        frames.sort_by_key(|frame| frame.order);
        Ok(frames)
    }

    fn insert_frame(&mut self, frame: NewFrame) -> RepositoryResult<FrameId> {
        if !self.threads.contains_key(&frame.thread) {
            return Err(RepositoryError::NotFound(format!("thread {}", frame.thread)));
        }
        if !self.symbol_sources.contains_key(&frame.symbol_source) {
            return Err(RepositoryError::NotFound(format!(
                "symbol source {}",
                frame.symbol_source
            )));
        }
        let taken = self
            .frames
            .values()
            .any(|f| f.thread == frame.thread && f.order == frame.order);
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "frame {} of thread {}",
                frame.order, frame.thread
            )));
        }

        let id = FrameId(self.next_id());
        self.frames.insert(
            id,
            ReportBtFrame {
                id,
                thread: frame.thread,
                order: frame.order,
                symbol_source: frame.symbol_source,
                inlined: frame.inlined,
                reliable: frame.reliable,
            },
        );
        Ok(id)
    }

    fn shift_frame_orders(
        &mut self,
        thread: ThreadId,
        from_order: u32,
        delta: u32,
    ) -> RepositoryResult<()> {
        for frame in self.frames.values_mut() {
            if frame.thread == thread && frame.order >= from_order {
                frame.order += delta;
            }
        }
        Ok(())
    }

    fn report(&self, id: ReportId) -> RepositoryResult<Report> {
        self.reports
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("report {id}")))
    }

    fn find_report_by_hash(
        &self,
        problem_type: &str,
        hash: &str,
    ) -> RepositoryResult<Option<Report>> {
        Ok(self
            .reports
            .values()
            .find(|report| report.problem_type == problem_type && report.hash == hash)
            .cloned())
    }

    fn create_report(
        &mut self,
        problem_type: &str,
        component: &str,
        hash: &str,
    ) -> RepositoryResult<ReportId> {
        if self.find_report_by_hash(problem_type, hash)?.is_some() {
            return Err(RepositoryError::Conflict(format!("report {hash}")));
        }
        let id = ReportId(self.next_id());
        self.reports.insert(
            id,
            Report {
                id,
                problem_type: problem_type.to_owned(),
                component: component.to_owned(),
                hash: hash.to_owned(),
                count: 0,
                problem: None,
            },
        );
        Ok(id)
    }

    fn bump_report_count(&mut self, id: ReportId, count: u64) -> RepositoryResult<()> {
        let report = self
            .reports
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("report {id}")))?;
        report.count += count;
        Ok(())
    }

    fn reports_of_type(&self, problem_type: &str) -> RepositoryResult<Vec<Report>> {
        Ok(self
            .reports
            .values()
            .filter(|report| report.problem_type == problem_type)
            .cloned()
            .collect())
    }

    fn backtrace(&self, id: BacktraceId) -> RepositoryResult<ReportBacktrace> {
        self.backtraces
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("backtrace {id}")))
    }

    fn backtraces_by_hash(&self, hash: &BacktraceHash) -> RepositoryResult<Vec<BacktraceId>> {
        Ok(self
            .backtraces
            .values()
            .filter(|backtrace| backtrace.hashes.contains(hash))
            .map(|backtrace| backtrace.id)
            .collect())
    }

    fn create_backtrace(
        &mut self,
        report: ReportId,
        hashes: Vec<BacktraceHash>,
        crash_function: Option<String>,
    ) -> RepositoryResult<BacktraceId> {
        if !self.reports.contains_key(&report) {
            return Err(RepositoryError::NotFound(format!("report {report}")));
        }
        let id = BacktraceId(self.next_id());
        self.backtraces.insert(
            id,
            ReportBacktrace {
                id,
                report,
                hashes,
                crash_function,
            },
        );
        Ok(id)
    }

    fn create_thread(
        &mut self,
        backtrace: BacktraceId,
        number: u32,
        crash_thread: bool,
    ) -> RepositoryResult<ThreadId> {
        if !self.backtraces.contains_key(&backtrace) {
            return Err(RepositoryError::NotFound(format!("backtrace {backtrace}")));
        }
        let id = ThreadId(self.next_id());
        self.threads.insert(
            id,
            ReportBtThread {
                id,
                backtrace,
                number,
                crash_thread,
            },
        );
        Ok(id)
    }

    fn report_backtraces(&self, report: ReportId) -> RepositoryResult<Vec<ReportBacktrace>> {
        Ok(self
            .backtraces
            .values()
            .filter(|backtrace| backtrace.report == report)
            .cloned()
            .collect())
    }

    fn backtrace_threads(&self, backtrace: BacktraceId) -> RepositoryResult<Vec<ReportBtThread>> {
        Ok(self
            .threads
            .values()
            .filter(|thread| thread.backtrace == backtrace)
            .cloned()
            .collect())
    }

    fn problems(&self) -> RepositoryResult<Vec<Problem>> {
        Ok(self.problems.values().cloned().collect())
    }

    fn problem_reports(&self, problem: ProblemId) -> RepositoryResult<Vec<ReportId>> {
        Ok(self
            .reports
            .values()
            .filter(|report| report.problem == Some(problem))
            .map(|report| report.id)
            .collect())
    }

    fn create_problem(&mut self) -> RepositoryResult<ProblemId> {
        let id = ProblemId(self.next_id());
        self.problems.insert(
            id,
            Problem {
                id,
                crash_function: None,
            },
        );
        Ok(id)
    }

    fn delete_problem(&mut self, problem: ProblemId) -> RepositoryResult<()> {
        if self.problems.remove(&problem).is_none() {
            return Err(RepositoryError::NotFound(format!("problem {problem}")));
        }
        for report in self.reports.values_mut() {
            if report.problem == Some(problem) {
                report.problem = None;
            }
        }
        Ok(())
    }

    fn assign_report_problem(
        &mut self,
        report: ReportId,
        problem: ProblemId,
    ) -> RepositoryResult<()> {
        if !self.problems.contains_key(&problem) {
            return Err(RepositoryError::NotFound(format!("problem {problem}")));
        }
        let report = self
            .reports
            .get_mut(&report)
            .ok_or_else(|| RepositoryError::NotFound(format!("report {report}")))?;
        report.problem = Some(problem);
        Ok(())
    }

    fn set_problem_crash_function(
        &mut self,
        problem: ProblemId,
        crash_function: Option<String>,
    ) -> RepositoryResult<()> {
        let problem = self
            .problems
            .get_mut(&problem)
            .ok_or_else(|| RepositoryError::NotFound(format!("problem {problem}")))?;
        problem.crash_function = crash_function;
        Ok(())
    }
}

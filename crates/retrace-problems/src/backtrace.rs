//! Storage of report backtraces, shared by all problem types.

use std::collections::BTreeSet;

use retrace_service::error::RepositoryError;
use retrace_service::repository::{NewFrame, NewSymbolSource, RetraceRepository};
use retrace_service::resolve::UNKNOWN;
use retrace_service::types::{
    BacktraceHash, BacktraceId, ReportBacktrace, ReportId, SymbolId, SymbolSourceId, ThreadId,
};

use crate::ProblemType;
use crate::error::ReportError;

/// Returns the symbol `name` in `normalized_path`, creating it if needed.
pub fn find_or_save_symbol(
    repo: &mut dyn RetraceRepository,
    name: &str,
    normalized_path: &str,
) -> Result<SymbolId, RepositoryError> {
    match repo.find_symbol(name, normalized_path)? {
        Some(symbol) => Ok(symbol.id),
        None => repo.save_symbol(name, None, normalized_path),
    }
}

/// Returns the symbol source with the key of `ssource`, creating it if needed.
///
/// An existing symbol source is returned as is, the other fields of `ssource` are ignored.
pub fn find_or_save_symbol_source(
    repo: &mut dyn RetraceRepository,
    ssource: NewSymbolSource,
) -> Result<SymbolSourceId, RepositoryError> {
    match repo.find_symbol_source(&ssource.key)? {
        Some(existing) => Ok(existing.id),
        None => repo.save_symbol_source(ssource),
    }
}

/// Looks for a stored backtrace of `report` matching any of `hashes`.
///
/// Hashes only match hashes of the same kind. Backtraces of other reports are not considered,
/// those are related through problem clustering instead.
pub fn find_report_backtrace(
    repo: &dyn RetraceRepository,
    report: ReportId,
    hashes: &[BacktraceHash],
) -> Result<Option<BacktraceId>, ReportError> {
    let mut matches = BTreeSet::new();
    for hash in hashes {
        for id in repo.backtraces_by_hash(hash)? {
            if repo.backtrace(id)?.report == report {
                matches.insert(id);
            }
        }
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        _ => Err(ReportError::AmbiguousBacktrace {
            report,
            backtraces: matches.into_iter().collect(),
        }),
    }
}

/// Appends frames to a stored thread, numbering them from 1.
#[derive(Debug)]
pub struct ThreadWriter {
    thread: ThreadId,
    order: u32,
}

impl ThreadWriter {
    pub fn new(
        repo: &mut dyn RetraceRepository,
        backtrace: BacktraceId,
        number: u32,
        crash_thread: bool,
    ) -> Result<Self, RepositoryError> {
        let thread = repo.create_thread(backtrace, number, crash_thread)?;
        Ok(Self { thread, order: 0 })
    }

    pub fn push(
        &mut self,
        repo: &mut dyn RetraceRepository,
        symbol_source: SymbolSourceId,
        reliable: bool,
    ) -> Result<(), RepositoryError> {
        self.order += 1;
        repo.insert_frame(NewFrame {
            thread: self.thread,
            order: self.order,
            symbol_source,
            inlined: false,
            reliable,
        })?;
        Ok(())
    }
}

/// Determines the crash function of a stored backtrace from its crash thread.
///
/// This reflects retracing done since the backtrace was saved. Demangled names are preferred.
/// Kernel oopses prefer reliable frames. Falls back to the crash function recorded when the
/// backtrace was saved.
pub fn crash_function(
    repo: &dyn RetraceRepository,
    problem_type: ProblemType,
    backtrace: &ReportBacktrace,
) -> Result<Option<String>, RepositoryError> {
    let threads = repo.backtrace_threads(backtrace.id)?;
    let Some(thread) = threads.iter().find(|thread| thread.crash_thread) else {
        tracing::warn!("Backtrace {} has no crash thread", backtrace.id);
        return Ok(backtrace.crash_function.clone());
    };

    let mut named = Vec::new();
    for frame in repo.thread_frames(thread.id)? {
        let ssource = repo.symbol_source(frame.symbol_source)?;
        let Some(symbol) = ssource.symbol else {
            continue;
        };
        let symbol = repo.symbol(symbol)?;
        if symbol.name == UNKNOWN {
            continue;
        }
        named.push((frame.reliable, symbol.nice_name.unwrap_or(symbol.name)));
    }

    let reliable = match problem_type {
        ProblemType::Kerneloops => named.iter().find(|(reliable, _)| *reliable),
        ProblemType::Core | ProblemType::Python => None,
    };

    Ok(reliable
        .or_else(|| named.first())
        .map(|(_, name)| name.clone())
        .or_else(|| backtrace.crash_function.clone()))
}

#[cfg(test)]
mod tests {
    use retrace_service::repository::MemoryRepository;
    use retrace_service::types::{HashKind, SymbolSourceKey};

    use super::*;

    fn ssource(repo: &mut MemoryRepository, offset: i64, symbol: Option<SymbolId>) -> SymbolSourceId {
        let key = SymbolSourceKey::new(Some("abcd".into()), "/usr/bin/foo", offset);
        find_or_save_symbol_source(
            repo,
            NewSymbolSource {
                symbol,
                ..NewSymbolSource::new(key)
            },
        )
        .unwrap()
    }

    #[test]
    fn test_find_or_save() {
        let mut repo = MemoryRepository::new();
        let a = find_or_save_symbol(&mut repo, "main", "foo").unwrap();
        let b = find_or_save_symbol(&mut repo, "main", "foo").unwrap();
        assert_eq!(a, b);

        let first = ssource(&mut repo, 0x10, None);
        let second = ssource(&mut repo, 0x10, Some(a));
        assert_eq!(first, second);
        assert_eq!(repo.symbol_sources().len(), 1);
    }

    #[test]
    fn test_ambiguous_backtrace() {
        let mut repo = MemoryRepository::new();
        let report = repo.create_report("core", "foo", "1234").unwrap();
        let names = BacktraceHash::new(HashKind::Names, "aaaa");
        let offsets = BacktraceHash::new(HashKind::Offsets, "bbbb");

        assert_eq!(
            find_report_backtrace(&repo, report, &[names.clone(), offsets.clone()]).unwrap(),
            None
        );

        let first = repo
            .create_backtrace(report, vec![names.clone()], None)
            .unwrap();
        assert_eq!(
            find_report_backtrace(&repo, report, &[names.clone(), offsets.clone()]).unwrap(),
            Some(first)
        );

        // same hash value, different kind
        let other = BacktraceHash::new(HashKind::Fingerprints, "aaaa");
        assert_eq!(find_report_backtrace(&repo, report, &[other]).unwrap(), None);

        let second = repo
            .create_backtrace(report, vec![offsets.clone()], None)
            .unwrap();
        let err = find_report_backtrace(&repo, report, &[names, offsets]).unwrap_err();
        match err {
            ReportError::AmbiguousBacktrace { backtraces, .. } => {
                assert_eq!(backtraces, [first, second]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_crash_function() {
        let mut repo = MemoryRepository::new();
        let report = repo.create_report("kerneloops", "kernel", "1234").unwrap();
        let backtrace = repo
            .create_backtrace(report, vec![], Some("fallback".into()))
            .unwrap();
        let backtrace = repo.backtrace(backtrace).unwrap();

        assert_eq!(
            crash_function(&repo, ProblemType::Core, &backtrace).unwrap().as_deref(),
            Some("fallback")
        );

        let unknown = find_or_save_symbol(&mut repo, UNKNOWN, "vmlinux").unwrap();
        let unreliable = find_or_save_symbol(&mut repo, "warn_slowpath_common", "vmlinux").unwrap();
        let reliable = find_or_save_symbol(&mut repo, "_ZN3foo3barEv", "vmlinux").unwrap();
        repo.set_symbol_nice_name(reliable, "foo::bar()").unwrap();

        let mut thread = ThreadWriter::new(&mut repo, backtrace.id, 1, true).unwrap();
        for (offset, symbol, is_reliable) in [
            (1, unknown, true),
            (2, unreliable, false),
            (3, reliable, true),
        ] {
            let id = ssource(&mut repo, offset, Some(symbol));
            thread.push(&mut repo, id, is_reliable).unwrap();
        }

        assert_eq!(
            crash_function(&repo, ProblemType::Core, &backtrace).unwrap().as_deref(),
            Some("warn_slowpath_common")
        );
        assert_eq!(
            crash_function(&repo, ProblemType::Kerneloops, &backtrace)
                .unwrap()
                .as_deref(),
            Some("foo::bar()")
        );
    }
}

//! Crashes of user-space binaries.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use retrace_service::error::{PairingError, RepositoryError, RetraceError};
use retrace_service::pool::RetraceStats;
use retrace_service::repository::{NewSymbolSource, RetraceRepository};
use retrace_service::resolve::{AddressMode, UNKNOWN, resolve_offset};
use retrace_service::task::{PackagePairing, RetraceTask};
use retrace_service::types::{BacktraceHash, BacktraceId, HashKind, SymbolSource, SymbolSourceKey};
use retrace_service::utils::paths::{build_id_debug_path, candidate_paths, libname, normalize};

use crate::backtrace::{ThreadWriter, find_or_save_symbol, find_or_save_symbol_source};
use crate::error::ReportError;
use crate::hashing::{ascii, hash_list};
use crate::retrace::RetraceContext;

static COMPONENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\-\._]+$").unwrap());
static HEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]+$").unwrap());

const ANONYMOUS_FUNCTION: &str = "anonymous function";
const UNKNOWN_FILENAME: &str = "unknown filename";

/// The payload of a `core` uReport.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoreReport {
    pub signal: i64,
    pub component: String,
    pub executable: String,
    pub user: CoreUser,
    pub stacktrace: Vec<CoreThread>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoreUser {
    pub root: bool,
    pub local: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoreThread {
    #[serde(default)]
    pub crash_thread: bool,
    pub frames: Vec<CoreFrame>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoreFrame {
    pub address: u64,
    pub build_id_offset: u64,
    pub file_name: Option<String>,
    pub build_id: Option<String>,
    pub fingerprint: Option<String>,
    pub function_name: Option<String>,
}

impl CoreFrame {
    fn file_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or_default()
    }
}

/// The frame attribute identifying a function in hashes.
#[derive(Clone, Copy, Debug)]
enum FrameKey {
    FunctionName,
    Fingerprint,
    Offset,
}

impl FrameKey {
    const ALL: [FrameKey; 3] = [Self::FunctionName, Self::Fingerprint, Self::Offset];

    fn get(self, frame: &CoreFrame) -> Option<String> {
        match self {
            Self::FunctionName => frame.function_name.clone(),
            Self::Fingerprint => frame.fingerprint.clone(),
            Self::Offset => Some(frame.build_id_offset.to_string()),
        }
    }

    fn kind(self) -> HashKind {
        match self {
            Self::FunctionName => HashKind::Names,
            Self::Fingerprint => HashKind::Fingerprints,
            Self::Offset => HashKind::Offsets,
        }
    }

    /// The first key every frame has.
    fn common(frames: &[CoreFrame]) -> Self {
        Self::ALL
            .into_iter()
            .find(|key| frames.iter().all(|frame| key.get(frame).is_some()))
            .unwrap_or(Self::Offset)
    }
}

/// Fills in frames calling into JIT compiled code, which carry neither a file nor a function.
///
/// Such frames inherit the file of the JIT caller above them. The last frame of a thread is
/// completed with placeholders, since the outermost frames are often unknown.
fn fix_jit_frames(report: &mut CoreReport) {
    for thread in &mut report.stacktrace {
        let mut jit_file = None;
        for frame in &mut thread.frames {
            if let (Some(file), Some(function)) = (&frame.file_name, &frame.function_name) {
                if function.to_lowercase().contains("jit") {
                    jit_file = Some(file.clone());
                }
            }

            if frame.file_name.is_none() {
                if let Some(ref file) = jit_file {
                    frame.file_name = Some(file.clone());
                    if frame.function_name.as_deref().is_none_or(|f| f == UNKNOWN) {
                        frame.function_name = Some(ANONYMOUS_FUNCTION.to_owned());
                    }
                }
            }
        }

        if let Some(last) = thread.frames.last_mut() {
            if last.file_name.is_none() {
                last.file_name = Some(UNKNOWN_FILENAME.to_owned());
            }
            if last.function_name.as_deref().is_none_or(|f| f == UNKNOWN) {
                last.function_name = Some(ANONYMOUS_FUNCTION.to_owned());
            }
        }
    }
}

/// Validates a report after completing frames of JIT compiled code.
pub fn validate(report: &mut CoreReport) -> Result<(), ReportError> {
    fix_jit_frames(report);

    if report.signal < 0 {
        return Err(ReportError::invalid("'signal' must not be negative"));
    }
    if !COMPONENT.is_match(&report.component) {
        return Err(ReportError::invalid(format!(
            "invalid component '{}'",
            report.component
        )));
    }
    if report.stacktrace.is_empty() {
        return Err(ReportError::invalid("'stacktrace' must not be empty"));
    }

    for thread in &report.stacktrace {
        if thread.frames.is_empty() {
            return Err(ReportError::invalid("thread without frames"));
        }
        for frame in &thread.frames {
            if frame.file_name.is_none() {
                return Err(ReportError::invalid("frame without 'file_name'"));
            }
            for (field, value) in [
                ("build_id", &frame.build_id),
                ("fingerprint", &frame.fingerprint),
            ] {
                if let Some(value) = value {
                    if !HEX.is_match(value) {
                        return Err(ReportError::invalid(format!(
                            "'{field}' is not hexadecimal: '{value}'"
                        )));
                    }
                }
            }
        }
    }

    crash_thread(report)?;
    Ok(())
}

/// Returns the frames of the only crash thread.
pub fn crash_thread(report: &CoreReport) -> Result<&[CoreFrame], ReportError> {
    let mut crash_threads = report.stacktrace.iter().filter(|t| t.crash_thread);
    let thread = crash_threads.next().ok_or(ReportError::NoCrashThread)?;
    if crash_threads.next().is_some() {
        return Err(ReportError::MultipleCrashThreads);
    }
    Ok(&thread.frames)
}

/// Hashes the component and the first `hash_frames` frames of the crash thread.
///
/// Frames are identified by function name if all of them have one, otherwise by fingerprint
/// and as a last resort by offset.
pub fn hash_ureport(report: &CoreReport, hash_frames: usize) -> Result<String, ReportError> {
    let frames = crash_thread(report)?;
    let frames = &frames[..frames.len().min(hash_frames)];
    let key = FrameKey::common(frames);

    let mut hashbase = vec![report.component.clone()];
    for frame in frames {
        hashbase.push(format!(
            "{} @ {}",
            key.get(frame).unwrap_or_default(),
            ascii(frame.file_name())
        ));
    }
    Ok(hash_list(hashbase))
}

/// Hashes all threads of the backtrace, once for every key that all frames have.
pub fn hash_backtrace(report: &CoreReport) -> Vec<BacktraceHash> {
    let mut result = Vec::new();

    for key in FrameKey::ALL {
        let complete = report
            .stacktrace
            .iter()
            .all(|thread| thread.frames.iter().all(|frame| key.get(frame).is_some()));
        if !complete {
            continue;
        }

        let mut hashbase = Vec::new();
        for thread in &report.stacktrace {
            hashbase.push(if thread.crash_thread { "Crash Thread" } else { "Thread" }.to_owned());
            for frame in &thread.frames {
                hashbase.push(format!(
                    "  {} @ {} ({})",
                    key.get(frame).unwrap_or_default(),
                    ascii(frame.file_name()),
                    frame.build_id.as_deref().unwrap_or("None")
                ));
            }
        }
        result.push(BacktraceHash::new(key.kind(), hash_list(hashbase)));
    }

    result
}

/// Returns the first named function of the crash thread.
pub fn crash_function(report: &CoreReport) -> Option<String> {
    crash_thread(report)
        .ok()?
        .iter()
        .filter_map(|frame| frame.function_name.as_deref())
        .find(|name| *name != UNKNOWN)
        .map(str::to_owned)
}

/// Stores all threads of the report in `backtrace`.
pub fn save_threads(
    repo: &mut dyn RetraceRepository,
    backtrace: BacktraceId,
    report: &CoreReport,
) -> Result<(), RepositoryError> {
    for (number, thread) in (1..).zip(&report.stacktrace) {
        let mut writer = ThreadWriter::new(repo, backtrace, number, thread.crash_thread)?;

        for frame in &thread.frames {
            let path = normalize(frame.file_name());
            let symbol = frame
                .function_name
                .as_deref()
                .map(|name| find_or_save_symbol(repo, name, libname(&path)))
                .transpose()?;

            let key = SymbolSourceKey::new(
                frame.build_id.clone(),
                path.as_str(),
                frame.build_id_offset as i64,
            );
            let ssource = find_or_save_symbol_source(
                repo,
                NewSymbolSource {
                    symbol,
                    hash: frame.fingerprint.clone(),
                    ..NewSymbolSource::new(key)
                },
            )?;
            writer.push(repo, ssource, true)?;
        }
    }
    Ok(())
}

/// Whether a symbol source of a core report can be retraced.
pub fn is_retraceable(ssource: &SymbolSource) -> bool {
    ssource.build_id().is_some()
}

/// Finds the packages needed to retrace `ssource`.
///
/// The debuginfo package is the one providing the debug file of the build id. The binary
/// package must be of the same build and architecture and provide the binary, possibly at a
/// location differing by `/usr`. Returns the path at which the binary was found.
pub fn find_packages(
    repo: &dyn RetraceRepository,
    ssource: &SymbolSource,
    skip_source: bool,
) -> Result<(String, PackagePairing), PairingError> {
    let build_id = ssource
        .build_id()
        .ok_or(PairingError::MissingBuildId(ssource.id))?;
    let debug_file = build_id_debug_path(build_id);
    tracing::debug!("Build-id: {}, file name: {}", build_id, debug_file);

    let debuginfo = repo
        .find_debuginfo_providers(&debug_file)?
        .into_iter()
        .next()
        .ok_or_else(|| PairingError::DebuginfoNotFound(debug_file.clone()))?;
    tracing::debug!("Debug package: {}", debuginfo.nvra());

    let mut found = None;
    for path in candidate_paths(ssource.path()) {
        if let Some(binary) = repo.find_binary_provider(debuginfo.build, &debuginfo.arch, &path)? {
            found = Some((path, binary));
            break;
        }
    }
    let (path, binary) =
        found.ok_or_else(|| PairingError::BinaryNotFound(ssource.path().to_owned()))?;
    tracing::debug!("Binary package: {}", binary.nvra());

    let source = if skip_source {
        None
    } else {
        repo.find_source_package(debuginfo.build)?
    };

    Ok((
        path,
        PackagePairing {
            debuginfo,
            binary,
            source,
        },
    ))
}

/// Resolves all symbol sources of an unpacked task.
pub fn retrace_task(
    repo: &mut dyn RetraceRepository,
    ctx: &RetraceContext<'_>,
    task: &RetraceTask,
    stats: &mut RetraceStats,
) -> Result<(), RetraceError> {
    let debug_dir = task
        .debug_dir()
        .ok_or_else(|| RetraceError::IncompleteTask(task.nvra().to_owned()))?;

    for (index, binary) in task.binaries.iter().enumerate() {
        let binary_dir = task
            .binary_dir(index)
            .ok_or_else(|| RetraceError::IncompleteTask(binary.package.nvra.clone()))?;
        tracing::info!("Retracing symbols from package {}", binary.package.nvra);

        let total = binary.symbol_sources.len();
        for (i, ssource) in binary.symbol_sources.iter().enumerate() {
            tracing::debug!("[{} / {}] Processing {}", i + 1, total, ssource.key);

            let path = binary_dir.join(ssource.path().trim_start_matches('/'));
            let result = resolve_offset(
                ctx.tools,
                &path,
                &debug_dir,
                ssource.address(),
                AddressMode::Relative,
            );
            match result {
                Ok(frames) => ctx.resolved(repo, ssource, libname(ssource.path()), &frames, stats)?,
                Err(err) => ctx.failed(repo, ssource, &err, stats)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use retrace_service::repository::MemoryRepository;
    use retrace_service::types::SymbolSourceId;
    use serde_json::json;

    use super::*;

    fn frame(function: &str, file: &str, offset: u64) -> serde_json::Value {
        json!({
            "address": 0x400000 + offset,
            "build_id_offset": offset,
            "file_name": file,
            "build_id": "7a8bc7a7a5a3a4f5e4b4b0ad2cbaa7c5d3f1b4c8",
            "function_name": function,
        })
    }

    fn report(frames: Vec<serde_json::Value>) -> CoreReport {
        serde_json::from_value(json!({
            "signal": 11,
            "component": "coreutils",
            "executable": "/usr/bin/sleep",
            "user": {"root": false, "local": true},
            "stacktrace": [
                {"crash_thread": true, "frames": frames},
                {"frames": [frame("poll", "/usr/lib64/libc.so.6", 0x99)]},
            ],
        }))
        .unwrap()
    }

    fn frames(count: u64) -> Vec<serde_json::Value> {
        (0..count)
            .map(|i| frame(&format!("func{i}"), "/usr/bin/sleep", 0x10 * i))
            .collect()
    }

    #[test]
    fn test_validate() {
        let mut valid = report(frames(3));
        validate(&mut valid).unwrap();

        let mut negative = report(frames(3));
        negative.signal = -1;
        assert!(matches!(validate(&mut negative), Err(ReportError::Invalid(_))));

        let mut component = report(frames(3));
        component.component = "core utils".into();
        assert!(matches!(validate(&mut component), Err(ReportError::Invalid(_))));

        let mut build_id = report(frames(3));
        build_id.stacktrace[0].frames[0].build_id = Some("xyz".into());
        assert!(matches!(validate(&mut build_id), Err(ReportError::Invalid(_))));

        let mut no_crash = report(frames(3));
        no_crash.stacktrace[0].crash_thread = false;
        assert!(matches!(validate(&mut no_crash), Err(ReportError::NoCrashThread)));

        let mut two_crashes = report(frames(3));
        two_crashes.stacktrace[1].crash_thread = true;
        assert!(matches!(
            validate(&mut two_crashes),
            Err(ReportError::MultipleCrashThreads)
        ));
    }

    #[test]
    fn test_jit_frames() {
        let mut report = report(vec![
            frame("g_main_loop_run", "/usr/lib64/libglib-2.0.so.0", 0x10),
            frame("js::jit::EnterBaselineMethod", "/usr/lib64/libmozjs.so", 0x20),
            json!({"address": 1, "build_id_offset": 1}),
            json!({"address": 2, "build_id_offset": 2, "function_name": "??"}),
        ]);
        validate(&mut report).unwrap();

        let frames = &report.stacktrace[0].frames;
        assert_eq!(frames[2].file_name.as_deref(), Some("/usr/lib64/libmozjs.so"));
        assert_eq!(frames[2].function_name.as_deref(), Some(ANONYMOUS_FUNCTION));
        assert_eq!(frames[3].file_name.as_deref(), Some("/usr/lib64/libmozjs.so"));
        assert_eq!(frames[3].function_name.as_deref(), Some(ANONYMOUS_FUNCTION));

        let mut last = self::report(vec![json!({"address": 1, "build_id_offset": 1})]);
        validate(&mut last).unwrap();
        let frame = &last.stacktrace[0].frames[0];
        assert_eq!(frame.file_name.as_deref(), Some(UNKNOWN_FILENAME));
        assert_eq!(frame.function_name.as_deref(), Some(ANONYMOUS_FUNCTION));
    }

    #[test]
    fn test_hash_ureport_window() {
        let a = report(frames(20));
        let b = report(frames(20));
        assert_eq!(hash_ureport(&a, 16).unwrap(), hash_ureport(&b, 16).unwrap());

        // frames beyond the window do not matter
        let mut beyond = report(frames(20));
        beyond.stacktrace[0].frames[18].function_name = Some("other".into());
        assert_eq!(hash_ureport(&a, 16).unwrap(), hash_ureport(&beyond, 16).unwrap());

        // frames within the window do
        let mut within = report(frames(20));
        within.stacktrace[0].frames[15].function_name = Some("other".into());
        assert_ne!(hash_ureport(&a, 16).unwrap(), hash_ureport(&within, 16).unwrap());

        let mut file = report(frames(20));
        file.stacktrace[0].frames[0].file_name = Some("/usr/bin/other".into());
        assert_ne!(hash_ureport(&a, 16).unwrap(), hash_ureport(&file, 16).unwrap());

        // a missing name beyond the window keeps hashing by name
        let mut unnamed = report(frames(20));
        unnamed.stacktrace[0].frames[17].function_name = None;
        assert_eq!(hash_ureport(&a, 16).unwrap(), hash_ureport(&unnamed, 16).unwrap());
    }

    #[test]
    fn test_hash_backtrace_kinds() {
        let named = report(frames(2));
        let kinds: Vec<_> = hash_backtrace(&named).iter().map(|h| h.kind).collect();
        assert_eq!(kinds, [HashKind::Names, HashKind::Offsets]);

        let mut unnamed = report(frames(2));
        unnamed.stacktrace[1].frames[0].function_name = None;
        unnamed.stacktrace[1].frames[0].fingerprint = Some("abcd".into());
        let hashes = hash_backtrace(&unnamed);
        let kinds: Vec<_> = hashes.iter().map(|h| h.kind).collect();
        assert_eq!(kinds, [HashKind::Offsets]);

        assert_eq!(hash_backtrace(&named)[1], hashes[0]);
    }

    #[test]
    fn test_crash_function() {
        let mut report = report(frames(3));
        report.stacktrace[0].frames[0].function_name = Some("??".into());
        assert_eq!(crash_function(&report).as_deref(), Some("func1"));
    }

    fn ssource(id: u64, path: &str) -> SymbolSource {
        SymbolSource {
            id: SymbolSourceId(id),
            key: SymbolSourceKey::new(Some("abcdef".into()), path, 0x10),
            symbol: None,
            func_offset: 0,
            hash: None,
            source_path: None,
            line_number: None,
            retrace_fail_count: 0,
        }
    }

    #[test]
    fn test_find_packages_usrmove() {
        let mut repo = MemoryRepository::new();
        let build = repo.new_build();
        let debug = repo.add_package("foo-debuginfo", "1.0", "1.fc40", "x86_64", build);
        repo.add_provides(debug, &["/usr/lib/debug/.build-id/ab/cdef.debug"]);
        let binary = repo.add_package("foo", "1.0", "1.fc40", "x86_64", build);
        repo.add_provides(binary, &["/usr/bin/foo"]);
        let source = repo.add_package("foo", "1.0", "1.fc40", "src", build);

        let (path, pairing) = find_packages(&repo, &ssource(1, "/bin/foo"), false).unwrap();
        assert_eq!(path, "/usr/bin/foo");
        assert_eq!(pairing.debuginfo.id, debug);
        assert_eq!(pairing.binary.id, binary);
        assert_eq!(pairing.source.map(|p| p.id), Some(source));

        let (_, pairing) = find_packages(&repo, &ssource(1, "/usr/bin/foo"), true).unwrap();
        assert_eq!(pairing.source, None);

        assert!(matches!(
            find_packages(&repo, &ssource(1, "/usr/bin/bar"), true),
            Err(PairingError::BinaryNotFound(_))
        ));

        let mut other = ssource(1, "/usr/bin/foo");
        other.key.build_id = Some("ffff".into());
        assert!(matches!(
            find_packages(&repo, &other, true),
            Err(PairingError::DebuginfoNotFound(_))
        ));
    }

    #[test]
    fn test_save_threads() {
        let mut repo = MemoryRepository::new();
        let report_id = repo.create_report("core", "coreutils", "1234").unwrap();
        let backtrace = repo.create_backtrace(report_id, vec![], None).unwrap();

        let mut report = report(frames(3));
        report.stacktrace[0].frames[2].function_name = None;
        save_threads(&mut repo, backtrace, &report).unwrap();

        let threads = repo.backtrace_threads(backtrace).unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads[0].crash_thread);

        let frames = repo.thread_frames(threads[0].id).unwrap();
        let orders: Vec<_> = frames.iter().map(|f| f.order).collect();
        assert_eq!(orders, [1, 2, 3]);

        let first = repo.symbol_source(frames[0].symbol_source).unwrap();
        let symbol = repo.symbol(first.symbol.unwrap()).unwrap();
        assert_eq!(symbol.name, "func0");
        assert_eq!(symbol.normalized_path, "sleep");

        let last = repo.symbol_source(frames[2].symbol_source).unwrap();
        assert_eq!(last.symbol, None);
        assert!(is_retraceable(&last));
    }
}

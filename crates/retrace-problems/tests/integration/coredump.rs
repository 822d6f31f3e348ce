use retrace_problems::retrace::Retracer;
use retrace_problems::{ProblemType, save_ureport};
use retrace_service::config::RetraceConfig;
use retrace_service::repository::{MemoryRepository, RetraceRepository};
use retrace_service::test::FakeTools;
use retrace_service::types::{ReportBtFrame, ReportId};
use serde_json::{Value, json};

use crate::{Pipeline, ureport};

const BUILD_ID: &str = "abcdef0123";
const DEBUG_FILE: &str = "/usr/lib/debug/.build-id/ab/cdef0123.debug";

fn frame(function: &str, offset: u64) -> Value {
    json!({
        "address": 0x7f0000000000u64 + offset,
        "build_id_offset": offset,
        "file_name": "/bin/foo",
        "build_id": BUILD_ID,
        "function_name": function,
    })
}

fn core_report(build_id: &str) -> Value {
    let mut report = json!({
        "type": "core",
        "signal": 11,
        "component": "foo",
        "executable": "/usr/bin/foo",
        "user": {"root": false, "local": true},
        "stacktrace": [
            {"crash_thread": true, "frames": [frame("a", 0x10), frame("b", 0x20), frame("c", 0x30)]},
            {"frames": [frame("d", 0x40)]},
        ],
    });
    for thread in report["stacktrace"].as_array_mut().unwrap() {
        for frame in thread["frames"].as_array_mut().unwrap() {
            frame["build_id"] = json!(build_id);
        }
    }
    report
}

/// Adds `foo` and its debuginfo package, both with package files.
fn add_packages(pipeline: &Pipeline, repo: &mut MemoryRepository) {
    let build = repo.new_build();

    let debuginfo = repo.add_package("foo-debuginfo", "1.0", "1.fc40", "x86_64", build);
    repo.add_provides(debuginfo, &[DEBUG_FILE]);
    pipeline.package_file(repo, debuginfo, &[DEBUG_FILE]);

    let binary = repo.add_package("foo", "1.0", "1.fc40", "x86_64", build);
    repo.add_provides(binary, &["/usr/bin/foo"]);
    pipeline.package_file(repo, binary, &["/usr/bin/foo"]);
}

fn tools() -> FakeTools {
    FakeTools::new()
        .with_addr2line(0x10, "a\n/src/foo.c:10\n")
        .with_addr2line(0x20, "bar inlined at /src/foo.c:20 in b\n/src/bar.c:5\n")
        .with_failing_addr2line(0x30)
        .with_addr2line(0x40, "d\n/src/foo.c:40\n")
}

fn crash_thread_frames(repo: &MemoryRepository, report: ReportId) -> Vec<ReportBtFrame> {
    let backtraces = repo.report_backtraces(report).unwrap();
    let threads = repo.backtrace_threads(backtraces[0].id).unwrap();
    let crash_thread = threads.iter().find(|thread| thread.crash_thread).unwrap();
    repo.thread_frames(crash_thread.id).unwrap()
}

fn function_name(repo: &MemoryRepository, frame: &ReportBtFrame) -> String {
    let ssource = repo.symbol_source(frame.symbol_source).unwrap();
    match ssource.symbol {
        Some(symbol) => repo.symbol(symbol).unwrap().name,
        None => "??".to_owned(),
    }
}

#[test]
fn test_retrace_core() {
    let pipeline = Pipeline::new();
    let mut repo = MemoryRepository::new();
    add_packages(&pipeline, &mut repo);

    let report = ureport(core_report(BUILD_ID));
    let report_id = save_ureport(&mut repo, &pipeline.processing, &report, 1).unwrap();

    let tools = tools();
    let retracer = Retracer::new(
        &tools,
        &pipeline.unpacker,
        &pipeline.config,
        &pipeline.processing,
    )
    .unwrap();
    let stats = retracer.retrace(&mut repo, ProblemType::Core).unwrap();

    assert_eq!(stats.resolved, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 0);

    let frames = crash_thread_frames(&repo, report_id);
    let names: Vec<_> = frames.iter().map(|f| function_name(&repo, f)).collect();
    assert_eq!(names, ["a", "bar", "b", "c"]);
    let orders: Vec<_> = frames.iter().map(|f| f.order).collect();
    assert_eq!(orders, [1, 2, 3, 4]);
    let inlined: Vec<_> = frames.iter().map(|f| f.inlined).collect();
    assert_eq!(inlined, [false, true, false, false]);

    let inlined = repo.symbol_source(frames[1].symbol_source).unwrap();
    assert_eq!(inlined.source_path.as_deref(), Some("/src/bar.c"));
    assert_eq!(inlined.line_number, Some(5));

    let outer = repo.symbol_source(frames[2].symbol_source).unwrap();
    assert_eq!(outer.source_path.as_deref(), Some("/src/foo.c"));
    assert_eq!(outer.line_number, Some(20));

    let failed = repo.symbol_source(frames[3].symbol_source).unwrap();
    assert!(!failed.is_resolved());
    assert_eq!(failed.retrace_fail_count, 1);

    // symbol sources move to the path the binary is packaged at
    let ssources = repo.symbol_sources();
    assert!(!ssources.is_empty());
    assert!(ssources.iter().all(|ssource| ssource.path() == "/usr/bin/foo"));
    assert!(
        tools
            .addr2line_binaries()
            .iter()
            .all(|binary| binary.ends_with("usr/bin/foo"))
    );

    assert!(pipeline.leftovers().is_empty());
}

#[test]
fn test_retrace_max_fail_count() {
    let pipeline = Pipeline::new();
    let mut repo = MemoryRepository::new();
    add_packages(&pipeline, &mut repo);

    let report = ureport(core_report(BUILD_ID));
    save_ureport(&mut repo, &pipeline.processing, &report, 1).unwrap();

    let tools = tools();
    let retracer = Retracer::new(
        &tools,
        &pipeline.unpacker,
        &pipeline.config,
        &pipeline.processing,
    )
    .unwrap();
    retracer.retrace(&mut repo, ProblemType::Core).unwrap();
    let calls = tools.addr2line_calls().len();

    let config = RetraceConfig {
        max_fail_count: Some(0),
        ..pipeline.config.clone()
    };
    let retracer =
        Retracer::new(&tools, &pipeline.unpacker, &config, &pipeline.processing).unwrap();
    let stats = retracer.retrace(&mut repo, ProblemType::Core).unwrap();

    assert_eq!(stats.total(), 0);
    assert_eq!(tools.addr2line_calls().len(), calls);
}

#[test]
fn test_retrace_missing_debuginfo() {
    let pipeline = Pipeline::new();
    let mut repo = MemoryRepository::new();
    add_packages(&pipeline, &mut repo);

    let report = ureport(core_report("0123456789"));
    save_ureport(&mut repo, &pipeline.processing, &report, 1).unwrap();

    let tools = tools();
    let retracer = Retracer::new(
        &tools,
        &pipeline.unpacker,
        &pipeline.config,
        &pipeline.processing,
    )
    .unwrap();
    let stats = retracer.retrace(&mut repo, ProblemType::Core).unwrap();

    assert_eq!(stats.skipped, 4);
    assert_eq!(stats.resolved + stats.failed, 0);
    assert!(tools.addr2line_calls().is_empty());

    // skipped symbol sources are retried by later runs
    let unresolved = repo.unresolved_symbol_sources("core", Some(0)).unwrap();
    assert_eq!(unresolved.len(), 4);
}

#[test]
fn test_retrace_python() {
    let pipeline = Pipeline::new();
    let mut repo = MemoryRepository::new();

    let report = ureport(json!({
        "type": "python",
        "component": "dnf",
        "exception_name": "KeyError",
        "traceback": [{
            "file_name": "/usr/bin/dnf",
            "file_line": 7,
            "is_module": true,
            "line_contents": "main()",
        }],
    }));
    save_ureport(&mut repo, &pipeline.processing, &report, 1).unwrap();

    let tools = FakeTools::new();
    let retracer = Retracer::new(
        &tools,
        &pipeline.unpacker,
        &pipeline.config,
        &pipeline.processing,
    )
    .unwrap();
    let stats = retracer.retrace(&mut repo, ProblemType::Python).unwrap();

    assert_eq!(stats.total(), 0);
    assert!(pipeline.leftovers().is_empty());
}

use retrace_problems::retrace::Retracer;
use retrace_problems::{ProblemType, save_ureport};
use retrace_service::repository::{MemoryRepository, RetraceRepository};
use retrace_service::test::FakeTools;
use serde_json::{Value, json};

use crate::{Pipeline, ureport};

const VMLINUX_DEBUG: &str = "/usr/lib/debug/lib/modules/5.14.0-1.fc35.x86_64/vmlinux";

fn kernel_frame(function: &str, address: u64) -> Value {
    json!({
        "address": address,
        "reliable": true,
        "function_name": function,
        "function_offset": 0x10,
        "function_length": 0x80,
    })
}

fn oops(version: &str) -> Value {
    json!({
        "type": "kerneloops",
        "component": "kernel",
        "version": version,
        "taint_flags": ["warning"],
        "frames": [
            kernel_frame("dump_stack", 0xffffffff81000010),
            kernel_frame("panic", 0xffffffff81000210),
        ],
    })
}

#[test]
fn test_retrace_kerneloops() {
    let pipeline = Pipeline::new();
    let mut repo = MemoryRepository::new();

    let build = repo.new_build();
    let debuginfo = repo.add_package("kernel-debuginfo", "5.14.0", "1.fc35", "x86_64", build);
    repo.add_provides(debuginfo, &[VMLINUX_DEBUG]);
    pipeline.package_file(&mut repo, debuginfo, &[VMLINUX_DEBUG]);

    let report = ureport(oops("5.14.0-1.fc35.x86_64"));
    let report_id = save_ureport(&mut repo, &pipeline.processing, &report, 1).unwrap();

    // the second frame resolves to `??` and fails
    let tools = FakeTools::new().with_addr2line(
        0xffffffff81000010,
        "dump_stack\n/usr/src/debug/kernel/lib/dump_stack.c:113\n",
    );
    let retracer = Retracer::new(
        &tools,
        &pipeline.unpacker,
        &pipeline.config,
        &pipeline.processing,
    )
    .unwrap();
    let stats = retracer.retrace(&mut repo, ProblemType::Kerneloops).unwrap();

    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 0);

    // absolute addresses, no rebasing onto a base address
    assert!(tools.addr2line_calls().contains(&0xffffffff81000010));
    assert!(
        tools
            .addr2line_binaries()
            .iter()
            .all(|binary| binary.ends_with(VMLINUX_DEBUG.trim_start_matches('/')))
    );

    let backtraces = repo.report_backtraces(report_id).unwrap();
    let threads = repo.backtrace_threads(backtraces[0].id).unwrap();
    let frames = repo.thread_frames(threads[0].id).unwrap();
    let resolved = repo.symbol_source(frames[0].symbol_source).unwrap();
    assert!(resolved.is_resolved());
    assert_eq!(
        resolved.source_path.as_deref(),
        Some("/usr/src/debug/kernel/lib/dump_stack.c")
    );
    assert_eq!(resolved.line_number, Some(113));

    let failed = repo.symbol_source(frames[1].symbol_source).unwrap();
    assert_eq!(failed.retrace_fail_count, 1);

    assert!(pipeline.leftovers().is_empty());
}

#[test]
fn test_retrace_unknown_kernel() {
    let pipeline = Pipeline::new();
    let mut repo = MemoryRepository::new();

    let build = repo.new_build();
    repo.add_package("kernel-debuginfo", "5.14.0", "1.fc35", "x86_64", build);

    let report = ureport(oops("5.15.0-1.fc35.x86_64"));
    save_ureport(&mut repo, &pipeline.processing, &report, 1).unwrap();

    let tools = FakeTools::new();
    let retracer = Retracer::new(
        &tools,
        &pipeline.unpacker,
        &pipeline.config,
        &pipeline.processing,
    )
    .unwrap();
    let stats = retracer.retrace(&mut repo, ProblemType::Kerneloops).unwrap();

    assert_eq!(stats.skipped, 2);
    assert!(tools.addr2line_calls().is_empty());
}

use retrace_problems::cluster::create_problems;
use retrace_problems::{ProblemType, UReport, save_ureport};
use retrace_service::config::ProcessingConfig;
use retrace_service::repository::{MemoryRepository, RetraceRepository};
use retrace_service::types::ReportId;
use serde_json::json;

fn core_report(component: &str, functions: &[&str], offset: u64) -> UReport {
    let frames: Vec<_> = functions
        .iter()
        .enumerate()
        .map(|(i, function)| {
            let offset = offset + 0x10 * i as u64;
            json!({
                "address": 0x400000 + offset,
                "build_id_offset": offset,
                "file_name": "/usr/bin/foo",
                "build_id": "7a8bc7a7",
                "function_name": function,
            })
        })
        .collect();

    crate::ureport(json!({
        "type": "core",
        "signal": 11,
        "component": component,
        "executable": "/usr/bin/foo",
        "user": {"root": false, "local": true},
        "stacktrace": [{"crash_thread": true, "frames": frames}],
    }))
}

fn save(repo: &mut MemoryRepository, report: &UReport) -> ReportId {
    save_ureport(repo, &ProcessingConfig::default(), report, 1).unwrap()
}

#[test]
fn test_create_problems() {
    let mut repo = MemoryRepository::new();
    let config = ProcessingConfig::default();

    // same backtrace reported against two components
    let a = save(&mut repo, &core_report("foo", &["crash", "main"], 0));
    let b = save(&mut repo, &core_report("foo-libs", &["crash", "main"], 0));
    let c = save(&mut repo, &core_report("foo", &["abort", "run"], 0x1000));

    let stats = create_problems(&mut repo, ProblemType::Core, &config).unwrap();
    assert_eq!(stats.clusters, 2);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.reused, 0);

    let problem_a = repo.report(a).unwrap().problem.unwrap();
    let problem_b = repo.report(b).unwrap().problem.unwrap();
    let problem_c = repo.report(c).unwrap().problem.unwrap();
    assert_eq!(problem_a, problem_b);
    assert_ne!(problem_a, problem_c);

    let problems = repo.problems().unwrap();
    let crash_function = |id| {
        problems
            .iter()
            .find(|problem| problem.id == id)
            .and_then(|problem| problem.crash_function.clone())
    };
    assert_eq!(crash_function(problem_a).as_deref(), Some("crash"));
    assert_eq!(crash_function(problem_c).as_deref(), Some("abort"));

    // clustering again keeps the problems
    let d = save(&mut repo, &core_report("foo-devel", &["abort", "run"], 0x1000));
    let stats = create_problems(&mut repo, ProblemType::Core, &config).unwrap();
    assert_eq!(stats.reused, 2);
    assert_eq!(stats.created, 0);
    assert_eq!(stats.removed, 0);
    assert_eq!(repo.report(a).unwrap().problem, Some(problem_a));
    assert_eq!(repo.report(d).unwrap().problem, Some(problem_c));
}

#[test]
fn test_problem_types_are_separate() {
    let mut repo = MemoryRepository::new();
    let config = ProcessingConfig::default();

    save(&mut repo, &core_report("foo", &["crash", "main"], 0));
    let stats = create_problems(&mut repo, ProblemType::Python, &config).unwrap();
    assert_eq!(stats.clusters, 0);
    assert!(repo.problems().unwrap().is_empty());
}

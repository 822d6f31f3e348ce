use retrace_problems::{ReportError, UReport, save_ureport};
use retrace_service::config::ProcessingConfig;
use retrace_service::repository::{MemoryRepository, RetraceRepository};
use serde_json::{Value, json};

fn core_report(frames: u64, changed: Option<u64>) -> String {
    let frames: Vec<Value> = (0..frames)
        .map(|i| {
            let (function, offset) = if Some(i) == changed {
                ("changed".to_owned(), 0x9990)
            } else {
                (format!("func{i}"), 0x10 * i)
            };
            json!({
                "address": 0x400000 + offset,
                "build_id_offset": offset,
                "file_name": "/usr/bin/foo",
                "build_id": "7a8bc7a7",
                "function_name": function,
            })
        })
        .collect();

    json!({
        "type": "core",
        "signal": 6,
        "component": "foo",
        "executable": "/usr/bin/foo",
        "user": {"root": false, "local": true},
        "stacktrace": [{"crash_thread": true, "frames": frames}],
    })
    .to_string()
}

#[test]
fn test_hash_window() {
    let mut repo = MemoryRepository::new();
    let config = ProcessingConfig::default();

    let original = UReport::parse(&core_report(20, None)).unwrap();
    let first = save_ureport(&mut repo, &config, &original, 1).unwrap();

    // frame 17 is outside of the report hash but part of the backtrace hash
    let changed = UReport::parse(&core_report(20, Some(16))).unwrap();
    let second = save_ureport(&mut repo, &config, &changed, 1).unwrap();
    assert_eq!(first, second);
    assert_eq!(repo.report_backtraces(first).unwrap().len(), 2);

    // a known backtrace of the same report is reused
    let third = save_ureport(&mut repo, &config, &changed, 5).unwrap();
    assert_eq!(first, third);
    assert_eq!(repo.report_backtraces(first).unwrap().len(), 2);
    assert_eq!(repo.report(first).unwrap().count, 7);

    let inside = UReport::parse(&core_report(20, Some(3))).unwrap();
    let fourth = save_ureport(&mut repo, &config, &inside, 1).unwrap();
    assert_ne!(first, fourth);
}

#[test]
fn test_invalid_reports() {
    let err = UReport::parse("{").unwrap_err();
    assert!(matches!(err, ReportError::Malformed(_)));

    let err = UReport::parse(&core_report(0, None)).unwrap_err();
    assert!(matches!(err, ReportError::Invalid(_)));

    let err = UReport::parse(r#"{"type": "java"}"#).unwrap_err();
    assert!(matches!(err, ReportError::UnknownType(_)));
}

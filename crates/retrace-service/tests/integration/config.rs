use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use retrace_service::config::{Config, LogFormat};
use retrace_test;

const CONFIG: &str = r#"
logging:
  level: trace
  format: json
metrics:
  statsd: 127.0.0.1:8125
  prefix: faf.retrace
retrace:
  workers: 4
  tmp_dir: /var/tmp/retrace
  max_fail_count: 3
  unpack_timeout: 20m
  tool_timeout: 30s
  tools:
    eu_addr2line: /opt/elfutils/bin/eu-addr2line
processing:
  hash_frames: 8
  skip_source: false
"#;

#[test]
fn test_load_config_file() {
    let dir = retrace_test::tempdir();
    let path = dir.path().join("retrace.yml");
    fs::write(&path, CONFIG).unwrap();

    let config = Config::get(Some(path.as_path())).unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
    assert_eq!(config.metrics.prefix, "faf.retrace");

    let retrace = &config.retrace;
    assert_eq!(retrace.workers, 4);
    assert_eq!(retrace.tmp_dir(), PathBuf::from("/var/tmp/retrace"));
    assert_eq!(retrace.max_fail_count, Some(3));
    assert_eq!(retrace.unpack_timeout, Duration::from_secs(20 * 60));
    assert_eq!(retrace.tool_timeout, Duration::from_secs(30));
    assert_eq!(
        retrace.tools.eu_addr2line,
        Path::new("/opt/elfutils/bin/eu-addr2line")
    );
    // unset tools keep their defaults
    assert_eq!(retrace.tools.cpio, Path::new("/usr/bin/cpio"));

    assert_eq!(config.processing.hash_frames, 8);
    assert!(!config.processing.skip_source);
    assert_eq!(config.processing.max_cluster_size, 5000);
}

#[test]
fn test_missing_config_file() {
    let dir = retrace_test::tempdir();
    let missing = dir.path().join("missing.yml");
    assert!(Config::get(Some(missing.as_path())).is_err());

    let config = Config::get(None).unwrap();
    assert_eq!(config.processing.hash_frames, 16);
}

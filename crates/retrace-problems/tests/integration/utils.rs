use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use retrace_problems::UReport;
use retrace_service::config::{ProcessingConfig, RetraceConfig, ToolsConfig};
use retrace_service::repository::MemoryRepository;
use retrace_service::types::PackageId;
use retrace_service::unpack::SystemUnpacker;
use retrace_test as test;

/// A retrace environment with fake `rpm2cpio` and `cpio` tools.
///
/// Package files written by [`Pipeline::package_file`] list the files the package contains, one
/// per line. Unpacking creates these files empty. Keep the pipeline alive for the entire test,
/// dropping it removes the temp directory.
pub struct Pipeline {
    pub tmp: test::TempDir,
    pub config: RetraceConfig,
    pub processing: ProcessingConfig,
    pub unpacker: SystemUnpacker,
}

impl Pipeline {
    pub fn new() -> Self {
        test::setup();
        let tmp = test::tempdir();

        let rpm2cpio = test::script(tmp.path(), "rpm2cpio", r#"cat "$1""#);
        let cpio = test::script(
            tmp.path(),
            "cpio",
            r#"while read -r file; do mkdir -p "$(dirname "$file")" && touch "$file" || exit 1; done"#,
        );

        let config = RetraceConfig {
            workers: 2,
            tmp_dir: Some(tmp.path().join("unpack")),
            unpack_timeout: Duration::from_secs(30),
            tools: ToolsConfig {
                rpm2cpio,
                cpio,
                ..Default::default()
            },
            ..Default::default()
        };
        let unpacker = SystemUnpacker::new(&config);

        Self {
            tmp,
            config,
            processing: ProcessingConfig::default(),
            unpacker,
        }
    }

    /// Writes the package file of `package` and registers it with the repository.
    pub fn package_file(&self, repo: &mut MemoryRepository, package: PackageId, files: &[&str]) {
        let path: PathBuf = self.tmp.path().join(format!("package-{}.rpm", package.0));
        let listing: String = files.iter().map(|file| format!(".{file}\n")).collect();
        fs::write(&path, listing).unwrap();
        repo.set_package_file(package, path);
    }

    /// Returns the entries left in the unpack directory.
    pub fn leftovers(&self) -> Vec<String> {
        test::list_dir(&self.tmp.path().join("unpack"))
    }
}

/// Parses and validates a uReport from JSON.
#[track_caller]
pub fn ureport(json: serde_json::Value) -> UReport {
    UReport::from_value(json).unwrap()
}

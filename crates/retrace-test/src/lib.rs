//! Helpers for testing the retrace pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is removed while
//!    unpacked packages or fake tools inside of it are still in use. To avoid this, assign it to
//!    a variable in the test function (e.g. `let _tmp = test::tempdir()`).
//!
//!  - External tools such as `rpm2cpio` or `cpio` can be replaced with shell scripts written by
//!    [`script`]. Point the tool paths of the configuration at the returned path.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `retrace` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "retrace_service=trace,retrace_problems=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes an executable `/bin/sh` script named `name` into `dir`.
///
/// The script body is placed below the shebang line. Returns the absolute path to the script.
///
/// # Panics
///
/// Panics if the script cannot be written or made executable.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lists the names of all entries directly below `dir`, sorted.
///
/// Returns an empty list if the directory does not exist.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

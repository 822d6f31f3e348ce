//! Extraction of packages into temporary directories.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::config::RetraceConfig;
use crate::error::{ToolError, UnpackError};
use crate::task::TaskPackage;
use crate::types::PackageKind;
use crate::utils::process::{check_status, collect, drain, wait_with_timeout};

/// Top-level directories which are merged into `/usr` on current distributions.
const FHS_DIRS: &[&str] = &["bin", "lib", "lib64", "sbin"];

/// The extracted contents of a package.
///
/// The directory is exclusively owned by this value and removed when it is dropped.
#[derive(Debug)]
pub struct UnpackedDir(TempDir);

impl UnpackedDir {
    pub fn new(dir: TempDir) -> Self {
        Self(dir)
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }

    /// Removes the directory, logging instead of failing if that is not possible.
    pub fn remove(self) {
        let path = self.0.path().to_owned();
        tracing::debug!("Removing {}", path.display());
        if let Err(err) = self.0.close() {
            tracing::warn!("Failed to remove {}: {}", path.display(), err);
        }
    }
}

/// Unpacks packages of a retrace task.
///
/// Implementations are shared between all workers of the
/// [`RetracePool`](crate::pool::RetracePool).
pub trait Unpacker: Send + Sync {
    /// Extracts `package` into a fresh directory.
    ///
    /// Every call creates a new directory, even for a package that has been unpacked before.
    fn unpack(&self, package: &TaskPackage) -> Result<UnpackedDir, UnpackError>;
}

/// Unpacks RPM packages with `rpm2cpio` and `cpio`.
#[derive(Clone, Debug)]
pub struct SystemUnpacker {
    config: RetraceConfig,
}

impl SystemUnpacker {
    pub fn new(config: &RetraceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn create_dir(&self, prefix: &str) -> Result<TempDir, UnpackError> {
        let tmp_dir = self.config.tmp_dir();
        let dir = fs::create_dir_all(&tmp_dir)
            .and_then(|_| {
                tempfile::Builder::new()
                    .prefix(&format!("{prefix}_"))
                    .tempdir_in(&tmp_dir)
            })
            .map_err(|err| UnpackError::TempDir(tmp_dir.clone(), err))?;

        create_fhs_links(dir.path()).map_err(|err| UnpackError::TempDir(tmp_dir, err))?;
        Ok(dir)
    }

    fn unpack_rpm(&self, package: &TaskPackage) -> Result<UnpackedDir, UnpackError> {
        let size = fs::metadata(&package.path)
            .map_err(|err| UnpackError::Unreadable(package.nvra.clone(), err))?
            .len();
        let timeout = self.config.unpack_timeout_for(size);

        let dir = self.create_dir(&package.nvra)?;
        tracing::debug!("Unpacking '{}' to {}", package.nvra, dir.path().display());

        let start = Instant::now();
        let result = self.extract_rpm(&package.path, dir.path(), timeout);
        metric!(timer("unpack.duration") = start.elapsed());

        match result {
            Ok(()) => Ok(UnpackedDir::new(dir)),
            Err(err) => {
                metric!(counter("unpack.failed") += 1);
                // dropping `dir` removes everything extracted so far
                drop(dir);
                Err(match err {
                    ToolError::Timeout { .. } => UnpackError::Timeout {
                        nvra: package.nvra.clone(),
                        timeout,
                    },
                    source => UnpackError::Extract {
                        nvra: package.nvra.clone(),
                        source,
                    },
                })
            }
        }
    }

    fn extract_rpm(&self, package: &Path, target: &Path, timeout: Duration) -> Result<(), ToolError> {
        let tools = &self.config.tools;
        let rpm2cpio_name = tool_name(&tools.rpm2cpio);
        let cpio_name = tool_name(&tools.cpio);
        let started = Instant::now();

        let mut rpm2cpio = Command::new(&tools.rpm2cpio)
            .arg(package)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: rpm2cpio_name.clone(),
                source,
            })?;

        // drained right away, a full stderr pipe would stall the archive
        let rpm2cpio_stderr = rpm2cpio.stderr.take().map(drain);

        let archive = rpm2cpio.stdout.take().ok_or_else(|| ToolError::Wait {
            tool: rpm2cpio_name.clone(),
            source: io::Error::other("stdout not captured"),
        });

        let cpio = archive.and_then(|archive| {
            Command::new(&tools.cpio)
                .args(["--extract", "-d", "--quiet"])
                .current_dir(target)
                .stdin(Stdio::from(archive))
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|source| ToolError::Spawn {
                    tool: cpio_name.clone(),
                    source,
                })
        });

        let extracted = cpio
            .and_then(|cpio| wait_with_timeout(&cpio_name, cpio, timeout))
            .and_then(|output| check_status(&cpio_name, output));

        // rpm2cpio is killed right away if cpio is gone already
        let remaining = match extracted {
            Ok(_) => timeout.saturating_sub(started.elapsed()),
            Err(_) => Duration::ZERO,
        };
        let converted = wait_with_timeout(&rpm2cpio_name, rpm2cpio, remaining).and_then(
            |mut output| {
                output.stderr =
                    collect(rpm2cpio_stderr).map_err(|source| ToolError::Wait {
                        tool: rpm2cpio_name.clone(),
                        source,
                    })?;
                check_status(&rpm2cpio_name, output)
            },
        );

        extracted?;
        converted?;
        Ok(())
    }
}

impl Unpacker for SystemUnpacker {
    fn unpack(&self, package: &TaskPackage) -> Result<UnpackedDir, UnpackError> {
        match package.kind {
            PackageKind::Rpm => self.unpack_rpm(package),
            kind => Err(UnpackError::Unsupported(kind)),
        }
    }
}

fn tool_name(path: &Path) -> String {
    path.display().to_string()
}

/// Creates `usr/{bin,lib,lib64,sbin}` and relative symlinks to them from the root of `dir`.
fn create_fhs_links(dir: &Path) -> io::Result<()> {
    for name in FHS_DIRS {
        let target = PathBuf::from("usr").join(name);
        fs::create_dir_all(dir.join(&target))?;
        symlink(&target, dir.join(name))?;
    }
    Ok(())
}

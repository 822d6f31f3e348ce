//! Packages made available to a run.
//!
//! A manifest is a YAML list of packages:
//!
//! ```yaml
//! - name: foo-debuginfo
//!   version: "1.0"
//!   release: 1.fc40
//!   arch: x86_64
//!   build: foo-1.0-1.fc40
//!   file: /srv/packages/foo-debuginfo-1.0-1.fc40.x86_64.rpm
//!   provides:
//!     - /usr/lib/debug/.build-id/7a/8bc7a7.debug
//! ```
//!
//! Packages with the same `build` label belong to the same build.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use retrace_service::repository::MemoryRepository;

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestPackage {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub build: String,
    /// The package file. Packages without a file are known but cannot be unpacked.
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub provides: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct PackageManifest(Vec<ManifestPackage>);

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open package manifest {}", path.display()))?;
        serde_yaml::from_reader(file).context("failed to parse package manifest")
    }

    /// Adds all packages to `repo`, returning their number.
    pub fn register(&self, repo: &mut MemoryRepository) -> usize {
        let mut builds = HashMap::new();

        for package in &self.0 {
            let build = *builds
                .entry(package.build.as_str())
                .or_insert_with(|| repo.new_build());
            let id = repo.add_package(
                &package.name,
                &package.version,
                &package.release,
                &package.arch,
                build,
            );

            let provides: Vec<_> = package.provides.iter().map(String::as_str).collect();
            repo.add_provides(id, &provides);
            if let Some(ref file) = package.file {
                repo.set_package_file(id, file.clone());
            }
        }

        self.0.len()
    }
}

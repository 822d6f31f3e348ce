//! Retrace tasks: the packages to unpack together and the symbol sources resolved with them.
//!
//! A task is a plain value. It holds no storage handles, so it can be moved to a worker thread
//! for unpacking and back to the consumer for resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{RepositoryError, RetraceError, UnpackError};
use crate::repository::RetraceRepository;
use crate::types::{Package, PackageId, PackageKind, SymbolSource, SymbolSourceId};
use crate::unpack::{UnpackedDir, Unpacker};

/// The processing state of a [`RetraceTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Unpacking,
    Unpacked,
    Resolving,
    Done,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Unpacking => "unpacking",
            Self::Unpacked => "unpacked",
            Self::Resolving => "resolving",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A package of a task together with the location of its package file.
#[derive(Debug)]
pub struct TaskPackage {
    pub id: PackageId,
    pub nvra: String,
    pub kind: PackageKind,
    /// The package file.
    pub path: PathBuf,
    /// Where the package was unpacked to, once it has been.
    pub unpacked: Option<UnpackedDir>,
}

impl TaskPackage {
    /// Creates a task package, failing with [`RetraceError::IncompleteTask`] if the package file
    /// is not in storage.
    pub fn new(package: &Package) -> Result<Self, RetraceError> {
        let nvra = package.nvra();
        let path = package
            .lob_path
            .clone()
            .ok_or_else(|| RetraceError::IncompleteTask(nvra.clone()))?;

        Ok(Self {
            id: package.id,
            nvra,
            kind: package.kind,
            path,
            unpacked: None,
        })
    }

    pub fn unpacked_path(&self) -> Option<&Path> {
        self.unpacked.as_ref().map(UnpackedDir::path)
    }

    fn unpack(&mut self, unpacker: &dyn Unpacker) -> Result<(), UnpackError> {
        tracing::debug!("Unpacking '{}'", self.nvra);
        self.unpacked = Some(unpacker.unpack(self)?);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(dir) = self.unpacked.take() {
            dir.remove();
        }
    }
}

/// A binary package and the symbol sources located in it.
#[derive(Debug)]
pub struct BinaryPackage {
    pub package: TaskPackage,
    pub symbol_sources: Vec<SymbolSource>,
}

/// One unit of retrace work: a debuginfo package, optionally its source package, and the binary
/// packages whose symbol sources are resolved with its debug information.
#[derive(Debug)]
pub struct RetraceTask {
    /// Sequence number of the task within its batch, starting at 1.
    pub id: usize,
    pub debuginfo: TaskPackage,
    pub source: Option<TaskPackage>,
    pub binaries: Vec<BinaryPackage>,
    /// Kernel debug files (`vmlinux` and `*.ko.debug`) provided by the debuginfo package.
    pub debug_files: Vec<String>,
    pub state: TaskState,
}

impl RetraceTask {
    pub fn nvra(&self) -> &str {
        &self.debuginfo.nvra
    }

    /// Returns the total number of symbol sources of this task.
    pub fn symbol_source_count(&self) -> usize {
        self.binaries.iter().map(|b| b.symbol_sources.len()).sum()
    }

    /// Unpacks every package of the task.
    ///
    /// A binary package with the same package file as the debuginfo package is not unpacked a
    /// second time, see [`binary_dir`](Self::binary_dir). On failure, everything unpacked so far
    /// is removed again.
    pub fn unpack(&mut self, unpacker: &dyn Unpacker) -> Result<(), UnpackError> {
        self.state = TaskState::Unpacking;

        match self.unpack_all(unpacker) {
            Ok(()) => {
                self.state = TaskState::Unpacked;
                Ok(())
            }
            Err(err) => {
                self.release();
                self.state = TaskState::Failed;
                Err(err)
            }
        }
    }

    fn unpack_all(&mut self, unpacker: &dyn Unpacker) -> Result<(), UnpackError> {
        self.debuginfo.unpack(unpacker)?;

        if let Some(ref mut source) = self.source {
            source.unpack(unpacker)?;
        }

        for binary in &mut self.binaries {
            if binary.package.path == self.debuginfo.path {
                tracing::debug!("'{}' is unpacked already", binary.package.nvra);
                continue;
            }
            binary.package.unpack(unpacker)?;
        }

        Ok(())
    }

    /// Returns the directory the binary package at `index` was unpacked to.
    pub fn binary_dir(&self, index: usize) -> Option<&Path> {
        let binary = self.binaries.get(index)?;
        binary.package.unpacked_path().or_else(|| {
            if binary.package.path == self.debuginfo.path {
                self.debuginfo.unpacked_path()
            } else {
                None
            }
        })
    }

    /// Returns the directory containing the debug files of the unpacked debuginfo package.
    pub fn debug_dir(&self) -> Option<PathBuf> {
        self.debuginfo
            .unpacked_path()
            .map(|path| path.join("usr").join("lib").join("debug"))
    }

    /// Removes every directory this task unpacked.
    pub fn release(&mut self) {
        self.debuginfo.release();
        if let Some(ref mut source) = self.source {
            source.release();
        }
        for binary in &mut self.binaries {
            binary.package.release();
        }
    }
}

/// The packages needed to retrace a single symbol source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackagePairing {
    pub debuginfo: Package,
    pub binary: Package,
    pub source: Option<Package>,
}

#[derive(Debug)]
struct TaskEntry {
    debuginfo: Package,
    source: Option<Package>,
    binaries: BTreeMap<PackageId, (Package, BTreeMap<SymbolSourceId, SymbolSource>)>,
}

/// Collects paired symbol sources into one [`RetraceTask`] per debuginfo package.
#[derive(Debug, Default)]
pub struct TaskBuilder {
    entries: BTreeMap<PackageId, TaskEntry>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a symbol source to the task of its debuginfo package.
    pub fn add(&mut self, pairing: PackagePairing, ssource: SymbolSource) {
        let entry = self
            .entries
            .entry(pairing.debuginfo.id)
            .or_insert_with(|| TaskEntry {
                debuginfo: pairing.debuginfo,
                source: pairing.source,
                binaries: BTreeMap::new(),
            });

        let (_, ssources) = entry
            .binaries
            .entry(pairing.binary.id)
            .or_insert_with(|| (pairing.binary, BTreeMap::new()));
        ssources.insert(ssource.id, ssource);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Creates the tasks.
    ///
    /// Tasks with a package whose file is not in storage are skipped.
    pub fn build(self, repo: &dyn RetraceRepository) -> Result<Vec<RetraceTask>, RepositoryError> {
        let total = self.entries.len();
        let mut tasks = Vec::with_capacity(total);

        for (i, entry) in self.entries.into_values().enumerate() {
            tracing::debug!(
                "[{} / {}] Creating task for '{}'",
                i + 1,
                total,
                entry.debuginfo.nvra()
            );

            let debug_files = repo.debug_files(entry.debuginfo.id)?;
            match Self::build_task(tasks.len() + 1, entry, debug_files) {
                Ok(task) => tasks.push(task),
                Err(err) => tracing::debug!("{}", err),
            }
        }

        Ok(tasks)
    }

    fn build_task(
        id: usize,
        entry: TaskEntry,
        debug_files: Vec<String>,
    ) -> Result<RetraceTask, RetraceError> {
        let debuginfo = TaskPackage::new(&entry.debuginfo)?;
        let source = entry.source.as_ref().map(TaskPackage::new).transpose()?;
        let binaries = entry
            .binaries
            .into_values()
            .map(|(package, ssources)| {
                Ok(BinaryPackage {
                    package: TaskPackage::new(&package)?,
                    symbol_sources: ssources.into_values().collect(),
                })
            })
            .collect::<Result<_, RetraceError>>()?;

        Ok(RetraceTask {
            id,
            debuginfo,
            source,
            binaries,
            debug_files,
            state: TaskState::Queued,
        })
    }
}

/// Groups symbol sources by build id and path, keeping the input order within each group.
///
/// All offsets within one binary need the same packages, so pairing is done once per group.
pub fn group_by_binary(
    ssources: Vec<SymbolSource>,
) -> BTreeMap<(Option<String>, String), Vec<SymbolSource>> {
    let mut groups: BTreeMap<_, Vec<_>> = BTreeMap::new();
    for ssource in ssources {
        groups
            .entry((ssource.key.build_id.clone(), ssource.key.path.clone()))
            .or_default()
            .push(ssource);
    }
    groups
}

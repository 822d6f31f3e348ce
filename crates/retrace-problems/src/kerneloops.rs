//! Kernel oopses.
//!
//! Kernel frames name their function and module already. Retracing adds the source location,
//! which requires the address of the function within its module. For `vmlinux` the reported
//! address is used as is. Module addresses are computed from the symbol table of the module's
//! debug file, see [`function_offset_map`].

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use retrace_service::error::{PairingError, RepositoryError, RetraceError};
use retrace_service::pool::RetraceStats;
use retrace_service::repository::{NewSymbolSource, RetraceRepository};
use retrace_service::resolve::{AddressMode, function_offset_map, kernel_address, resolve_offset};
use retrace_service::task::{PackagePairing, RetraceTask};
use retrace_service::types::{
    BacktraceHash, BacktraceId, HashKind, PackageId, SymbolSource, SymbolSourceKey,
};

use crate::backtrace::{ThreadWriter, find_or_save_symbol, find_or_save_symbol_source};
use crate::error::ReportError;
use crate::hashing::hash_list;
use crate::retrace::RetraceContext;

static COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(kernel|xorg-x11-drv-[a-z\-]+)(-[a-zA-Z0-9\-\._]+)?$").unwrap()
});
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+(.[^\-]+)?(\-.*)?$").unwrap());
static MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_]+(\([A-Z\+\-]+\))?$").unwrap());
static FUNCTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\.]+$").unwrap());

/// The module of frames without a module name.
pub const VMLINUX: &str = "vmlinux";

/// Replaces the name of unreliable frames the client could not name.
const UNKNOWN_FUNCTION: &str = "_unknown_";

/// Kernel taint flags: the name used in uReports, the flag character and its meaning.
pub const TAINT_FLAGS: &[(&str, char, &str)] = &[
    ("module_proprietary", 'P', "Proprietary module has been loaded"),
    ("forced_module", 'F', "Module has been forcibly loaded"),
    ("smp_unsafe", 'S', "SMP with CPUs not designed for SMP"),
    ("forced_removal", 'R', "User forced a module unload"),
    ("mce", 'M', "System experienced a machine check exception"),
    ("page_release", 'B', "System has hit bad_page"),
    ("userspace", 'U', "Userspace-defined naughtiness"),
    ("died_recently", 'D', "Kernel has oopsed before"),
    ("acpi_overridden", 'A', "ACPI table overridden"),
    ("warning", 'W', "Taint on warning"),
    ("staging_driver", 'C', "Modules from drivers/staging are loaded"),
    ("firmware_workaround", 'I', "Working around severe firmware bug"),
    ("module_out_of_tree", 'O', "Out-of-tree module has been loaded"),
    ("unsigned_module", 'E', "Unsigned module has been loaded"),
    ("soft_lockup", 'L', "A soft lockup previously occurred"),
    ("live_patch", 'K', "Kernel has been live patched"),
];

/// The payload of a `kerneloops` uReport.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KerneloopsReport {
    pub component: String,
    /// The kernel build, e.g. `3.10.0-3.fc19.x86_64`.
    pub version: String,
    pub taint_flags: Vec<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    pub raw_oops: Option<String>,
    pub frames: Vec<KernelFrame>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KernelFrame {
    pub address: Option<u64>,
    pub reliable: bool,
    pub function_name: Option<String>,
    pub function_offset: u64,
    pub function_length: u64,
    pub module_name: Option<String>,
}

impl KernelFrame {
    fn function(&self) -> &str {
        self.function_name.as_deref().unwrap_or(UNKNOWN_FUNCTION)
    }

    fn module(&self) -> &str {
        self.module_name.as_deref().unwrap_or(VMLINUX)
    }
}

/// Strips the taint suffix of a module name, `nvidia(PO)` becomes `nvidia`.
fn strip_taint(module: &str) -> &str {
    module.split_once('(').map_or(module, |(name, _)| name)
}

/// Validates a report after naming unnamed unreliable frames.
pub fn validate(report: &mut KerneloopsReport) -> Result<(), ReportError> {
    for frame in &mut report.frames {
        if frame.function_name.is_none() && !frame.reliable {
            frame.function_name = Some(UNKNOWN_FUNCTION.to_owned());
        }
    }

    if !COMPONENT.is_match(&report.component) {
        return Err(ReportError::invalid(format!(
            "invalid component '{}'",
            report.component
        )));
    }
    if !VERSION.is_match(&report.version) {
        return Err(ReportError::invalid(format!(
            "invalid kernel version '{}'",
            report.version
        )));
    }
    for flag in &report.taint_flags {
        if !TAINT_FLAGS.iter().any(|(name, _, _)| name == flag) {
            return Err(ReportError::invalid(format!("unknown taint flag '{flag}'")));
        }
    }
    for module in &report.modules {
        if !MODULE.is_match(module) {
            return Err(ReportError::invalid(format!("invalid module '{module}'")));
        }
    }
    if report.frames.is_empty() {
        return Err(ReportError::invalid("'frames' must not be empty"));
    }

    for frame in &report.frames {
        let Some(ref function) = frame.function_name else {
            return Err(ReportError::invalid("reliable frame without 'function_name'"));
        };
        if !FUNCTION.is_match(function) {
            return Err(ReportError::invalid(format!(
                "invalid function name '{function}'"
            )));
        }
        if let Some(ref module) = frame.module_name {
            if !MODULE.is_match(module) {
                return Err(ReportError::invalid(format!("invalid module '{module}'")));
            }
        }
        if i64::try_from(frame.function_offset).is_err()
            || i64::try_from(frame.function_length).is_err()
        {
            return Err(ReportError::invalid(format!(
                "function offset of '{function}' out of range"
            )));
        }
    }

    Ok(())
}

/// Hashes the component, the taint flags and the first `hash_frames` frames.
pub fn hash_ureport(report: &KerneloopsReport, hash_frames: usize) -> String {
    let frames = report
        .frames
        .iter()
        .take(hash_frames)
        .map(|frame| format!("{} @ {}", frame.function(), frame.module()));

    let mut hashbase = vec![report.component.clone()];
    hashbase.extend(report.taint_flags.iter().cloned());
    hashbase.extend(frames);
    hash_list(hashbase)
}

fn frame_hashbase(frame: &KernelFrame) -> String {
    format!(
        "{} {}+{}/{} @ {}",
        frame.address.unwrap_or(0),
        frame.function(),
        frame.function_offset,
        frame.function_length,
        frame.module()
    )
}

/// Hashes all frames, and the reliable frames only if that differs.
pub fn hash_backtrace(report: &KerneloopsReport) -> Vec<BacktraceHash> {
    let all = hash_list(report.frames.iter().map(frame_hashbase));
    let mut result = vec![BacktraceHash::new(HashKind::Names, all.clone())];

    let reliable: Vec<_> = report
        .frames
        .iter()
        .filter(|frame| frame.reliable)
        .map(frame_hashbase)
        .collect();
    if !reliable.is_empty() {
        let reliable = hash_list(reliable);
        if reliable != all {
            result.push(BacktraceHash::new(HashKind::Names, reliable));
        }
    }

    result
}

/// The first reliable frame, or the first frame if none is reliable.
pub fn crash_function(report: &KerneloopsReport) -> Option<String> {
    report
        .frames
        .iter()
        .find(|frame| frame.reliable)
        .or_else(|| report.frames.first())
        .map(|frame| frame.function().to_owned())
}

/// Stores the frames of the report as the single crash thread of `backtrace`.
///
/// Frames whose function name is an address are misparsed and dropped.
pub fn save_threads(
    repo: &mut dyn RetraceRepository,
    backtrace: BacktraceId,
    report: &KerneloopsReport,
) -> Result<(), RepositoryError> {
    let mut writer = ThreadWriter::new(repo, backtrace, 1, true)?;

    for frame in &report.frames {
        let function = frame.function();
        if function.starts_with("0x") {
            continue;
        }

        let module = strip_taint(frame.module());
        let symbol = find_or_save_symbol(repo, function, module)?;

        // addresses in the upper half wrap to negative offsets
        let offset = frame.address.unwrap_or(0) as i64;
        let key = SymbolSourceKey::new(Some(report.version.clone()), module, offset);
        let ssource = find_or_save_symbol_source(
            repo,
            NewSymbolSource {
                symbol: Some(symbol),
                func_offset: frame.function_offset as i64,
                ..NewSymbolSource::new(key)
            },
        )?;
        writer.push(repo, ssource, frame.reliable)?;
    }
    Ok(())
}

/// Whether a symbol source of a kernel oops can be retraced.
///
/// The function name is needed to find module addresses.
pub fn is_retraceable(ssource: &SymbolSource) -> bool {
    ssource.symbol.is_some() && ssource.build_id().is_some()
}

/// The parts of a kernel build string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelBuild {
    pub version: String,
    pub release: String,
    pub arch: String,
    pub flavour: Option<String>,
}

impl KernelBuild {
    /// The name of the debuginfo package of this build.
    pub fn debuginfo_name(&self) -> String {
        match self.flavour {
            Some(ref flavour) => format!("kernel-{flavour}-debuginfo"),
            None => "kernel-debuginfo".to_owned(),
        }
    }
}

/// Parses kernel build strings such as `3.10.0-3.fc19.x86_64`, `3.10.0-3.fc19.armv7hl.tegra`,
/// `2.6.32-358.14.1.el6.i686.PAE` or `3.15.6-200.fc20.i686+PAE`.
pub fn parse_kernel_build(
    build: &str,
    archs: &BTreeSet<String>,
) -> Result<KernelBuild, PairingError> {
    let error = |what| PairingError::KernelVersion {
        what,
        input: build.to_owned(),
    };

    let separator = if build.contains('+') { '+' } else { '.' };
    let (mut head, tail) = build
        .rsplit_once(separator)
        .ok_or_else(|| error("architecture"))?;

    let (arch, flavour) = if archs.contains(tail) {
        (tail, None)
    } else {
        let (rest, arch) = head.rsplit_once('.').ok_or_else(|| error("architecture"))?;
        if !archs.contains(arch) {
            return Err(error("architecture"));
        }
        head = rest;
        (arch, Some(tail.to_owned()))
    };

    let (version, release) = head.rsplit_once('-').ok_or_else(|| error("release"))?;
    Ok(KernelBuild {
        version: version.to_owned(),
        release: release.to_owned(),
        arch: arch.to_owned(),
        flavour,
    })
}

/// Finds kernel packages, remembering the result per kernel build.
#[derive(Debug, Default)]
pub struct KernelPairing {
    archs: Option<BTreeSet<String>>,
    packages: HashMap<String, Option<PackagePairing>>,
}

impl KernelPairing {
    /// Finds the packages needed to retrace `ssource`.
    ///
    /// The debuginfo package contains the debug files of all modules and serves as the binary
    /// package as well.
    pub fn find_packages(
        &mut self,
        repo: &dyn RetraceRepository,
        ssource: &SymbolSource,
        skip_source: bool,
    ) -> Result<PackagePairing, PairingError> {
        let build = ssource
            .build_id()
            .ok_or(PairingError::MissingBuildId(ssource.id))?;

        if !self.packages.contains_key(build) {
            let pairing = self.lookup(repo, build, skip_source)?;
            self.packages.insert(build.to_owned(), pairing);
        }

        self.packages
            .get(build)
            .cloned()
            .flatten()
            .ok_or_else(|| PairingError::DebuginfoNotFound(build.to_owned()))
    }

    fn lookup(
        &mut self,
        repo: &dyn RetraceRepository,
        build: &str,
        skip_source: bool,
    ) -> Result<Option<PackagePairing>, PairingError> {
        let archs = match self.archs.take() {
            Some(archs) => archs,
            None => repo.known_archs()?.into_iter().collect(),
        };
        let kernel = parse_kernel_build(build, self.archs.insert(archs))?;
        let name = kernel.debuginfo_name();

        let Some(debuginfo) =
            repo.find_package_by_nevra(&name, 0, &kernel.version, &kernel.release, &kernel.arch)?
        else {
            tracing::debug!(
                "Package {}-{}-{}.{} not found in storage",
                name,
                kernel.version,
                kernel.release,
                kernel.arch
            );
            return Ok(None);
        };

        let source = if skip_source {
            None
        } else {
            let name = format!("kernel-debuginfo-common-{}", kernel.arch);
            let source =
                repo.find_package_by_name_build_arch(&name, debuginfo.build, &debuginfo.arch)?;
            if source.is_none() {
                tracing::debug!("Package {} of {} not found in storage", name, build);
            }
            source
        };

        Ok(Some(PackagePairing {
            binary: debuginfo.clone(),
            debuginfo,
            source,
        }))
    }
}

/// Returns the path of the debug file of `module` within `package`.
fn debug_path(
    repo: &dyn RetraceRepository,
    package: PackageId,
    module: &str,
) -> Result<Option<String>, RepositoryError> {
    if module == VMLINUX {
        return repo.find_package_file(package, VMLINUX);
    }

    if let Some(path) = repo.find_package_file(package, &format!("{module}.ko.debug"))? {
        return Ok(Some(path));
    }
    let dashed = module.replace('_', "-");
    repo.find_package_file(package, &format!("{dashed}.ko.debug"))
}

/// Resolves all symbol sources of an unpacked kernel debuginfo task.
pub fn retrace_task(
    repo: &mut dyn RetraceRepository,
    ctx: &RetraceContext<'_>,
    task: &RetraceTask,
    stats: &mut RetraceStats,
) -> Result<(), RetraceError> {
    let incomplete = || RetraceError::IncompleteTask(task.nvra().to_owned());
    let unpacked = task.debuginfo.unpacked_path().ok_or_else(incomplete)?;
    let debug_dir = task.debug_dir().ok_or_else(incomplete)?;

    let offset_map = ctx.offset_maps.get_with(task.nvra().to_owned(), || {
        let files: Vec<PathBuf> = task
            .debug_files
            .iter()
            .map(|file| unpacked.join(file.trim_start_matches('/')))
            .collect();
        tracing::debug!("Building function offset map from {} files", files.len());
        Arc::new(function_offset_map(ctx.tools, &files))
    });

    for binary in &task.binaries {
        let total = binary.symbol_sources.len();
        for (i, ssource) in binary.symbol_sources.iter().enumerate() {
            let module = ssource.path();
            let Some(symbol) = ssource.symbol else {
                ctx.failed(repo, ssource, &"no function name", stats)?;
                continue;
            };
            let symbol = repo.symbol(symbol)?;
            tracing::info!(
                "[{} / {}] Processing '{}' @ '{}'",
                i + 1,
                total,
                symbol.name,
                module
            );

            let address = if module == VMLINUX {
                ssource.address()
            } else {
                match kernel_address(&offset_map, module, &symbol.name, ssource.func_offset) {
                    Ok(address) => address,
                    Err(err) => {
                        ctx.failed(repo, ssource, &err, stats)?;
                        continue;
                    }
                }
            };

            let Some(path) = debug_path(repo, task.debuginfo.id, module)? else {
                let reason = format!("debug file of module '{module}' not found");
                ctx.failed(repo, ssource, &reason, stats)?;
                continue;
            };

            let binary = unpacked.join(path.trim_start_matches('/'));
            match resolve_offset(ctx.tools, &binary, &debug_dir, address, AddressMode::Absolute) {
                Ok(frames) => ctx.resolved(repo, ssource, module, &frames, stats)?,
                Err(err) => ctx.failed(repo, ssource, &err, stats)?,
            }
        }
    }

    Ok(())
}

//! The retrace batch: pairing unresolved symbol sources with packages and resolving them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use retrace_service::config::{ProcessingConfig, RetraceConfig};
use retrace_service::error::{PairingError, RepositoryError, RetraceError};
use retrace_service::metric;
use retrace_service::pool::{RetracePool, RetraceStats};
use retrace_service::repository::RetraceRepository;
use retrace_service::resolve::{DemangleCache, OffsetMapCache, demangle_cache, offset_map_cache};
use retrace_service::symbols::{apply_resolution, fix_symbol_source_path};
use retrace_service::task::{PackagePairing, TaskBuilder, group_by_binary};
use retrace_service::tools::DebugTools;
use retrace_service::types::{ResolvedFrame, SymbolSource};
use retrace_service::unpack::Unpacker;

use crate::ProblemType;
use crate::coredump;
use crate::kerneloops::{self, KernelPairing};

/// Shared state of the retrace consumer.
pub struct RetraceContext<'a> {
    pub tools: &'a dyn DebugTools,
    pub demangle_cache: &'a DemangleCache,
    pub offset_maps: &'a OffsetMapCache,
}

impl RetraceContext<'_> {
    /// Stores the frames `ssource` resolved to.
    pub fn resolved(
        &self,
        repo: &mut dyn RetraceRepository,
        ssource: &SymbolSource,
        normalized_path: &str,
        frames: &[ResolvedFrame],
        stats: &mut RetraceStats,
    ) -> Result<(), RepositoryError> {
        if apply_resolution(
            repo,
            self.tools,
            self.demangle_cache,
            ssource.id,
            normalized_path,
            frames,
        )? {
            stats.resolved += 1;
            metric!(counter("retrace.symbols") += 1, "status" => "resolved");
        }
        Ok(())
    }

    /// Counts a failed attempt to resolve `ssource`.
    pub fn failed(
        &self,
        repo: &mut dyn RetraceRepository,
        ssource: &SymbolSource,
        reason: &dyn fmt::Display,
        stats: &mut RetraceStats,
    ) -> Result<(), RepositoryError> {
        tracing::debug!("Failed to retrace {}: {}", ssource.key, reason);
        repo.record_retrace_failure(ssource.id)?;
        stats.failed += 1;
        metric!(counter("retrace.symbols") += 1, "status" => "failed");
        Ok(())
    }
}

/// Package lookup of a problem type.
enum Pairer {
    Core,
    Kernel(KernelPairing),
}

impl Pairer {
    fn new(problem_type: ProblemType) -> Option<Self> {
        if !problem_type.needs_retrace() {
            return None;
        }
        Some(match problem_type {
            ProblemType::Kerneloops => Self::Kernel(KernelPairing::default()),
            _ => Self::Core,
        })
    }

    fn is_retraceable(&self, ssource: &SymbolSource) -> bool {
        match self {
            Self::Core => coredump::is_retraceable(ssource),
            Self::Kernel(_) => kerneloops::is_retraceable(ssource),
        }
    }

    /// Returns the packages of `ssource` and the path its binary is packaged at, if it differs.
    fn find_packages(
        &mut self,
        repo: &dyn RetraceRepository,
        ssource: &SymbolSource,
        skip_source: bool,
    ) -> Result<(Option<String>, PackagePairing), PairingError> {
        match self {
            Self::Core => coredump::find_packages(repo, ssource, skip_source)
                .map(|(path, pairing)| (Some(path), pairing)),
            Self::Kernel(kernel) => kernel
                .find_packages(repo, ssource, skip_source)
                .map(|pairing| (None, pairing)),
        }
    }
}

/// Runs retrace batches for all problem types.
pub struct Retracer<'a> {
    tools: &'a dyn DebugTools,
    unpacker: &'a dyn Unpacker,
    config: &'a RetraceConfig,
    processing: &'a ProcessingConfig,
    demangle_cache: DemangleCache,
    offset_maps: OffsetMapCache,
    pool: RetracePool,
}

impl fmt::Debug for Retracer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retracer")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<'a> Retracer<'a> {
    pub fn new(
        tools: &'a dyn DebugTools,
        unpacker: &'a dyn Unpacker,
        config: &'a RetraceConfig,
        processing: &'a ProcessingConfig,
    ) -> Result<Self, RetraceError> {
        Ok(Self {
            tools,
            unpacker,
            config,
            processing,
            demangle_cache: demangle_cache(config.demangle_cache_capacity),
            offset_maps: offset_map_cache(config.offset_map_cache_capacity),
            pool: RetracePool::new(config.workers)?,
        })
    }

    /// See [`RetracePool::stop_handle`].
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.pool.stop_handle()
    }

    /// Resolves the unresolved symbol sources of reports of `problem_type`.
    ///
    /// Symbol sources without packages are skipped and left for a later batch, as are symbol
    /// sources that fail to resolve. Afterwards, symbol sources no frame refers to are deleted.
    pub fn retrace(
        &self,
        repo: &mut dyn RetraceRepository,
        problem_type: ProblemType,
    ) -> Result<RetraceStats, RetraceError> {
        let mut stats = RetraceStats::default();
        let Some(mut pairer) = Pairer::new(problem_type) else {
            tracing::info!("Retracing is not required for {}", problem_type.nice_name());
            return Ok(stats);
        };

        let ssources: Vec<_> = repo
            .unresolved_symbol_sources(problem_type.name(), self.config.max_fail_count)?
            .into_iter()
            .filter(|ssource| pairer.is_retraceable(ssource))
            .collect();
        tracing::info!(
            "Retracing {} symbol sources of {}",
            ssources.len(),
            problem_type
        );
        metric!(
            gauge("retrace.pending") = ssources.len() as u64,
            "problem_type" => problem_type.name()
        );

        let mut builder = TaskBuilder::new();
        for ((_, path), group) in group_by_binary(ssources) {
            let Some(first) = group.first() else {
                continue;
            };

            let (packaged_path, pairing) =
                match pairer.find_packages(repo, first, self.processing.skip_source) {
                    Ok(found) => found,
                    Err(PairingError::Repository(err)) => return Err(err.into()),
                    Err(err) => {
                        tracing::warn!(
                            "Skipping {} symbol sources of '{}': {}",
                            group.len(),
                            path,
                            err
                        );
                        stats.skipped += group.len();
                        metric!(
                            counter("retrace.symbols") += group.len() as i64,
                            "status" => "skipped"
                        );
                        continue;
                    }
                };

            for ssource in group {
                let ssource = match packaged_path {
                    Some(ref packaged) if *packaged != ssource.key.path => {
                        let id = fix_symbol_source_path(repo, ssource.id, packaged)?;
                        repo.symbol_source(id)?
                    }
                    _ => ssource,
                };
                if !ssource.is_resolved() {
                    builder.add(pairing.clone(), ssource);
                }
            }
        }

        let tasks = builder.build(repo)?;
        tracing::info!("Created {} retrace tasks", tasks.len());

        let ctx = RetraceContext {
            tools: self.tools,
            demangle_cache: &self.demangle_cache,
            offset_maps: &self.offset_maps,
        };

        let total = tasks.len();
        let pool_stats = self.pool.run(tasks, self.unpacker, |task| {
            let _guard = tracing::info_span!("task", task = task.id, nvra = task.nvra()).entered();
            tracing::info!(
                "[{} / {}] Retracing {} symbol sources",
                task.id,
                total,
                task.symbol_source_count()
            );

            match pairer {
                Pairer::Core => coredump::retrace_task(repo, &ctx, task, &mut stats),
                Pairer::Kernel(_) => kerneloops::retrace_task(repo, &ctx, task, &mut stats),
            }
        })?;

        let orphans = repo.delete_orphan_symbol_sources()?;
        tracing::debug!("Deleted {} orphaned symbol sources", orphans);

        tracing::info!(
            "Retraced {}: {} tasks done, {} failed; {}",
            problem_type,
            pool_stats.done,
            pool_stats.failed,
            stats
        );
        Ok(stats)
    }
}

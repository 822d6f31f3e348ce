//! Exposes the command line application.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use retrace_problems::cluster::create_problems;
use retrace_problems::retrace::Retracer;
use retrace_problems::{ProblemType, UReport, save_ureport};
use retrace_service::config::Config;
use retrace_service::repository::{MemoryRepository, RetraceRepository};
use retrace_service::tools::Elfutils;
use retrace_service::unpack::SystemUnpacker;
use retrace_service::{logging, metrics};

use crate::manifest::PackageManifest;

/// Retrace commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Save, retrace and cluster uReports.
    Process {
        /// Packages available for retracing, in YAML format.
        #[arg(long, value_name = "FILE")]
        packages: Option<PathBuf>,

        /// uReport files in JSON format.
        #[arg(required = true, value_name = "REPORT")]
        reports: Vec<PathBuf>,
    },

    /// Validate uReports and print their hashes.
    Hash {
        /// uReport files in JSON format.
        #[arg(required = true, value_name = "REPORT")]
        reports: Vec<PathBuf>,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: No other threads have been started yet.
    unsafe { logging::init_logging(&config) };
    metrics::configure_from_config(&config.metrics).context("failed to configure statsd")?;

    match cli.command {
        Command::Process { packages, reports } => process(&config, packages.as_deref(), &reports),
        Command::Hash { reports } => hash(&config, &reports),
    }
}

fn read_report(path: &Path) -> Result<UReport> {
    let input = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    UReport::parse(&input).with_context(|| format!("invalid uReport {}", path.display()))
}

fn hash(config: &Config, reports: &[PathBuf]) -> Result<()> {
    for path in reports {
        let report = read_report(path)?;
        println!("{}", path.display());
        println!("  type:   {}", report.problem_type());
        println!("  report: {}", report.hash(config.processing.hash_frames)?);
        for hash in report.backtrace_hashes() {
            println!("  {}: {}", hash.kind, hash.hash);
        }
    }
    Ok(())
}

fn process(config: &Config, packages: Option<&Path>, reports: &[PathBuf]) -> Result<()> {
    let mut repo = MemoryRepository::new();
    if let Some(path) = packages {
        let count = PackageManifest::load(path)?.register(&mut repo);
        tracing::info!("Registered {} packages", count);
    }

    let mut saved = 0;
    for path in reports {
        let report = read_report(path)?;
        match save_ureport(&mut repo, &config.processing, &report, 1) {
            Ok(_) => saved += 1,
            Err(err) => tracing::warn!("Failed to save {}: {}", path.display(), err),
        }
    }
    tracing::info!("Saved {} of {} reports", saved, reports.len());

    let tools = Elfutils::new(&config.retrace);
    let unpacker = SystemUnpacker::new(&config.retrace);
    let retracer = Retracer::new(&tools, &unpacker, &config.retrace, &config.processing)?;

    for problem_type in ProblemType::ALL {
        let stats = retracer.retrace(&mut repo, problem_type)?;
        let clusters = create_problems(&mut repo, problem_type, &config.processing)?;
        println!("{}: {}; {}", problem_type.nice_name(), stats, clusters);
    }

    for problem in repo.problems()? {
        let reports = repo.problem_reports(problem.id)?;
        println!(
            "problem {}: {} reports, crashed in {}",
            problem.id,
            reports.len(),
            problem.crash_function.as_deref().unwrap_or("??")
        );
    }

    Ok(())
}

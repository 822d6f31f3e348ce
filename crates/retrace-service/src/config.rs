use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Output format of log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One line per event without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Level of the `retrace_*` crates, overridden by `RUST_LOG`.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE` so that errors capture backtraces.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Reporting of retrace metrics to statsd.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Defaults to `$STATSD_SERVER`; metrics are off without it.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "retrace".into(),
            custom_tags: Default::default(),
        }
    }
}

/// Paths to the external tools invoked while unpacking and retracing.
///
/// Plain names are looked up in `PATH`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Converts the payload of an RPM package into a cpio archive.
    pub rpm2cpio: PathBuf,
    /// Extracts a cpio archive into the current directory.
    pub cpio: PathBuf,
    /// Computes the load address of a binary (`eu-unstrip -n -e`).
    pub eu_unstrip: PathBuf,
    /// Resolves an address to function, source file and line.
    pub eu_addr2line: PathBuf,
    /// Dumps the ELF symbol table of a file.
    pub eu_readelf: PathBuf,
    /// Demangles C++ symbol names.
    pub cxxfilt: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rpm2cpio: PathBuf::from("/usr/bin/rpm2cpio"),
            cpio: PathBuf::from("/usr/bin/cpio"),
            eu_unstrip: PathBuf::from("eu-unstrip"),
            eu_addr2line: PathBuf::from("eu-addr2line"),
            eu_readelf: PathBuf::from("eu-readelf"),
            cxxfilt: PathBuf::from("c++filt"),
        }
    }
}

/// Fine-tuning of the retrace worker pool and its subprocesses.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetraceConfig {
    /// Number of threads unpacking packages.
    ///
    /// Defaults to the available parallelism of the machine.
    pub workers: usize,

    /// Directory below which packages are unpacked.
    ///
    /// Defaults to `retrace` in the system temp directory.
    pub tmp_dir: Option<PathBuf>,

    /// Only retrace symbol sources which failed at most this number of times.
    ///
    /// A value of `None` retraces every unresolved symbol source.
    pub max_fail_count: Option<u32>,

    /// The base timeout for unpacking a single package.
    ///
    /// Kernel debuginfo packages are among the largest packages and may take several minutes to
    /// extract, so this is generous by default.
    #[serde(with = "humantime_serde")]
    pub unpack_timeout: Duration,

    /// Additional unpack time granted per GiB of package size.
    #[serde(with = "humantime_serde")]
    pub unpack_timeout_per_gb: Duration,

    /// The timeout for a single invocation of a debug tool such as `eu-addr2line`.
    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,

    /// Number of debuginfo packages for which kernel function offset maps are kept in memory.
    pub offset_map_cache_capacity: u64,

    /// Number of demangled names kept in memory.
    pub demangle_cache_capacity: u64,

    /// Paths to external tools.
    pub tools: ToolsConfig,
}

impl RetraceConfig {
    /// Returns the directory below which packages are unpacked.
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("retrace"))
    }

    /// Returns the unpack timeout for a package of `size` bytes.
    pub fn unpack_timeout_for(&self, size: u64) -> Duration {
        let gib = size as f64 / (1024.0 * 1024.0 * 1024.0);
        self.unpack_timeout + self.unpack_timeout_per_gb.mul_f64(gib)
    }
}

impl Default for RetraceConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            tmp_dir: None,
            max_fail_count: None,
            // 15 minutes are enough for the biggest kernel debuginfo packages we have seen.
            unpack_timeout: Duration::from_secs(15 * 60),
            unpack_timeout_per_gb: Duration::from_secs(5 * 60),
            tool_timeout: Duration::from_secs(60),
            offset_map_cache_capacity: 16,
            demangle_cache_capacity: 100_000,
            tools: ToolsConfig::default(),
        }
    }
}

/// Fine-tuning of report hashing and clustering.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of crash thread frames taken into account by report hashes.
    pub hash_frames: usize,

    /// Do not look up and unpack source packages while retracing.
    pub skip_source: bool,

    /// Upper bound for the number of reports merged into one problem by a single cluster.
    pub max_cluster_size: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            hash_frames: 16,
            skip_source: true,
            max_cluster_size: 5000,
        }
    }
}

/// The configuration of a run, loaded from a YAML file with [`Config::get`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    pub retrace: RetraceConfig,
    pub processing: ProcessingConfig,
}

impl Config {
    /// Loads the file at `path`, or returns the defaults without one.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        Self::from_reader(file)
    }

    fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("cannot read config file")?;
        // empty files are an error, not the defaults
        if yaml.trim().is_empty() {
            bail!("config file is empty");
        }
        serde_yaml::from_str(&yaml).context("invalid config file")
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::unknown_variant(&level, &["off", "error", "warn", "info", "debug", "trace"])
    })
}

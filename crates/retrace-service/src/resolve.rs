//! Resolution of binary addresses to functions and source locations.
//!
//! The resolver drives the [`DebugTools`] and interprets their output. `eu-addr2line` prints two
//! lines per address:
//!
//! ```text
//! <function>[+0x<offset>][ inlined at <file>:<line> in <outer function>]
//! <source file>:<line>[:<column>]
//! ```
//!
//! Either the function or the source location may be `??` if the tool cannot tell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::ResolveError;
use crate::tools::DebugTools;
use crate::types::ResolvedFrame;

static ADDR2LINE_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([_0-9a-zA-Z\.~<>@:\*&,\)\( \[\]=]+|operator[^ ]+|\?\?)(\+0x[0-9a-f]+)?( inlined at ([^:]+):([0-9]+) in (.*))?$",
    )
    .unwrap()
});

static UNSTRIP_BASE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((0x)?[0-9a-f]+)").unwrap());

/// How many addresses below the requested one are tried when `eu-addr2line` returns `??`.
///
/// Return addresses pushed by signal handlers are frequently off by one, so the address is
/// decremented until the tool finds a function at the same source location.
pub const MAX_ADDRESS_DECREMENTS: u64 = 15;

/// Placeholder printed by the elfutils tools for unknown names and files.
pub const UNKNOWN: &str = "??";

/// How the address of a symbol source is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    /// The address is an offset relative to the base address of the binary.
    Relative,
    /// The address is absolute, for instance a kernel address.
    Absolute,
}

/// One parsed answer of `eu-addr2line`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Addr2LineRecord {
    /// The function containing the address, or `??`.
    pub function: String,
    /// Where `function` was inlined, if it was.
    pub inlined_at: Option<InlinedAt>,
    pub source_file: String,
    pub line: u32,
}

/// The call site of an inlined function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlinedAt {
    pub file: String,
    pub line: u32,
    /// The function the inlined body is part of.
    pub function: String,
}

/// Parses the output of `eu-unstrip -n -e` into the base address of the binary.
pub fn parse_base_address(output: &str) -> Result<u64, ResolveError> {
    let malformed = || ResolveError::MalformedBaseAddress(output.trim().to_owned());

    let captures = UNSTRIP_BASE_ADDRESS.captures(output).ok_or_else(malformed)?;
    let token = &captures[1];
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|_| malformed())
}

/// Parses the two line output of `eu-addr2line --functions` for a single address.
pub fn parse_addr2line(output: &str) -> Result<Addr2LineRecord, ResolveError> {
    let malformed = || ResolveError::MalformedAddr2Line(output.trim().to_owned());

    let mut lines = output.lines();
    let (Some(line1), Some(line2), None) = (lines.next(), lines.next(), lines.next()) else {
        return Err(malformed());
    };

    // filename:lineno[:columnno]
    let mut location = line2.split(':');
    let source_file = location.next().ok_or_else(malformed)?;
    let line = location
        .next()
        .and_then(|line| line.parse().ok())
        .ok_or_else(malformed)?;

    let captures = ADDR2LINE_FUNCTION
        .captures(line1)
        .ok_or_else(|| ResolveError::MalformedAddr2Line(line1.to_owned()))?;

    let inlined_at = match (captures.get(4), captures.get(5), captures.get(6)) {
        (Some(file), Some(line), Some(function)) => Some(InlinedAt {
            file: file.as_str().to_owned(),
            line: line.as_str().parse().map_err(|_| malformed())?,
            function: function.as_str().to_owned(),
        }),
        _ => None,
    };

    Ok(Addr2LineRecord {
        function: captures[1].to_owned(),
        inlined_at,
        source_file: source_file.to_owned(),
        line,
    })
}

/// Returns the base address of `binary`.
pub fn base_address(tools: &dyn DebugTools, binary: &Path) -> Result<u64, ResolveError> {
    parse_base_address(&tools.unstrip(binary)?)
}

/// Resolves `address` within `binary` to an ordered list of frames.
///
/// The last frame is the function containing the address. If the address is part of an
/// inlined function body, the inlined function precedes it.
///
/// When the tool cannot name the function, up to [`MAX_ADDRESS_DECREMENTS`] lower addresses are
/// tried, as long as they map to the same (or no) source location.
pub fn address_to_line(
    tools: &dyn DebugTools,
    binary: &Path,
    debug_dir: &Path,
    address: u64,
) -> Result<Vec<ResolvedFrame>, ResolveError> {
    let mut resolved = None;
    let mut source_file = UNKNOWN.to_owned();
    let mut line = 0;

    for decrement in 0..MAX_ADDRESS_DECREMENTS {
        if decrement > address {
            break;
        }

        metric!(counter("resolve.attempts") += 1);
        let output = tools.addr2line(binary, debug_dir, address - decrement)?;
        let record = parse_addr2line(&output)?;

        let same_location = source_file == record.source_file && line == record.line;
        let location_known = source_file != UNKNOWN || line != 0;
        if !same_location && location_known {
            break;
        }

        if record.function == UNKNOWN {
            source_file = record.source_file;
            line = record.line;
            continue;
        }

        resolved = Some(match record.inlined_at {
            None => (None, ResolvedFrame::new(record.function, record.source_file, record.line)),
            Some(at) => (
                Some(ResolvedFrame::new(
                    record.function,
                    record.source_file,
                    record.line,
                )),
                ResolvedFrame::new(at.function, at.file, at.line),
            ),
        });
        break;
    }

    let (inlined, frame) = resolved.ok_or(ResolveError::FunctionNotFound)?;
    let mut frames: Vec<_> = inlined.into_iter().collect();
    frames.push(frame);
    Ok(frames)
}

/// Resolves a symbol source's `offset` within `binary`.
///
/// In [`AddressMode::Relative`] the offset is rebased onto the base address of the binary first.
pub fn resolve_offset(
    tools: &dyn DebugTools,
    binary: &Path,
    debug_dir: &Path,
    offset: u64,
    mode: AddressMode,
) -> Result<Vec<ResolvedFrame>, ResolveError> {
    let address = match mode {
        AddressMode::Absolute => offset,
        AddressMode::Relative => base_address(tools, binary)?.wrapping_add(offset),
    };
    address_to_line(tools, binary, debug_dir, address)
}

/// A cache of demangled names. `None` marks names which do not demangle.
pub type DemangleCache = moka::sync::Cache<String, Option<String>>;

pub fn demangle_cache(capacity: u64) -> DemangleCache {
    DemangleCache::builder()
        .name("demangle")
        .max_capacity(capacity)
        .build()
}

/// Demangles `name`, returning `None` if the demangled form does not differ.
///
/// A failing demangler is not an error, the name is used as is.
pub fn demangle(tools: &dyn DebugTools, cache: &DemangleCache, name: &str) -> Option<String> {
    let init = || match tools.demangle(name) {
        Ok(demangled) if !demangled.is_empty() && demangled != name => Some(demangled),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!("Failed to demangle '{}': {}", name, err);
            None
        }
    };

    cache.entry_by_ref(name).or_insert_with(init).into_value()
}

/// Function addresses of every kernel module, keyed by module name and function name.
///
/// Module names use `_` instead of `-`. Function names are stored without leading underscores.
pub type FunctionOffsetMap = HashMap<String, HashMap<String, u64>>;

/// Offset maps keyed by the NVRA of the debuginfo package they were built from.
pub type OffsetMapCache = moka::sync::Cache<String, Arc<FunctionOffsetMap>>;

pub fn offset_map_cache(capacity: u64) -> OffsetMapCache {
    OffsetMapCache::builder()
        .name("offset-map")
        .max_capacity(capacity)
        .build()
}

/// Returns the module name of a kernel debug file, e.g. `e1000` for `.../e1000.ko.debug`.
pub fn module_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().replace('-', "_"))
        .unwrap_or_default();
    match name.strip_suffix(".ko.debug") {
        Some(stripped) => stripped.to_owned(),
        None => name,
    }
}

/// Builds the [`FunctionOffsetMap`] from the symbol tables of `vmlinux` and `*.ko.debug` files.
///
/// Files whose symbol table cannot be read contribute an empty module.
pub fn function_offset_map(tools: &dyn DebugTools, files: &[PathBuf]) -> FunctionOffsetMap {
    let mut result = FunctionOffsetMap::new();

    for file in files {
        let functions = result.entry(module_name(file)).or_default();
        let output = match tools.readelf_symbols(file) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!("Failed to read symbols of {}: {}", file.display(), err);
                continue;
            }
        };

        for line in output.lines() {
            if !line.contains("FUNC") && !line.contains("NOTYPE") {
                continue;
            }
            let columns: Vec<_> = line.split_whitespace().collect();
            let (Some(address), Some(name)) = (columns.get(1), columns.get(7)) else {
                continue;
            };
            if let Ok(address) = u64::from_str_radix(address, 16) {
                functions.insert(name.trim_start_matches('_').to_owned(), address);
            }
        }
    }

    result
}

/// Computes the absolute address of `function + func_offset` within a kernel module.
pub fn kernel_address(
    map: &FunctionOffsetMap,
    module: &str,
    function: &str,
    func_offset: i64,
) -> Result<u64, ResolveError> {
    let not_found = || ResolveError::KernelSymbolNotFound {
        module: module.to_owned(),
        function: function.to_owned(),
    };

    let functions = map.get(module).ok_or_else(not_found)?;
    let start = functions
        .get(function)
        .or_else(|| functions.get(function.trim_start_matches('_')))
        .ok_or_else(not_found)?;

    Ok(start.wrapping_add_signed(func_offset))
}

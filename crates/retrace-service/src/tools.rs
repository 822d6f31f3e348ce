//! Invocation of the external debug tools.
//!
//! [`DebugTools`] returns the raw output of every tool. Interpreting that output is the job of
//! the [`resolve`](crate::resolve) module, which keeps the tools replaceable in tests.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::config::{RetraceConfig, ToolsConfig};
use crate::error::ToolError;
use crate::utils::process::run_with_timeout;

/// The set of tools needed to resolve addresses to functions.
pub trait DebugTools {
    /// Prints the module list of `binary`, starting with its base address.
    fn unstrip(&self, binary: &Path) -> Result<String, ToolError>;

    /// Resolves `address` within `binary` to a function and source location.
    fn addr2line(&self, binary: &Path, debug_dir: &Path, address: u64)
    -> Result<String, ToolError>;

    /// Dumps the symbol table of `file`.
    fn readelf_symbols(&self, file: &Path) -> Result<String, ToolError>;

    /// Demangles a single symbol name.
    fn demangle(&self, name: &str) -> Result<String, ToolError>;
}

/// [`DebugTools`] backed by the elfutils binaries and `c++filt`.
#[derive(Clone, Debug)]
pub struct Elfutils {
    tools: ToolsConfig,
    timeout: Duration,
}

impl Elfutils {
    pub fn new(config: &RetraceConfig) -> Self {
        Self {
            tools: config.tools.clone(),
            timeout: config.tool_timeout,
        }
    }

    fn run(&self, tool: &Path, args: &[&OsStr]) -> Result<String, ToolError> {
        let name = tool.display().to_string();
        let mut command = Command::new(tool);
        command.args(args);
        tracing::trace!("Running {} {:?}", name, args);

        let output = run_with_timeout(&name, command, self.timeout)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DebugTools for Elfutils {
    fn unstrip(&self, binary: &Path) -> Result<String, ToolError> {
        self.run(
            &self.tools.eu_unstrip,
            &[OsStr::new("-n"), OsStr::new("-e"), binary.as_os_str()],
        )
    }

    fn addr2line(
        &self,
        binary: &Path,
        debug_dir: &Path,
        address: u64,
    ) -> Result<String, ToolError> {
        let mut executable = OsString::from("--executable=");
        executable.push(binary);
        let mut debuginfo_path = OsString::from("--debuginfo-path=");
        debuginfo_path.push(debug_dir);
        let address = format!("{address:#x}");

        self.run(
            &self.tools.eu_addr2line,
            &[
                executable.as_os_str(),
                debuginfo_path.as_os_str(),
                OsStr::new("--functions"),
                OsStr::new(&address),
            ],
        )
    }

    fn readelf_symbols(&self, file: &Path) -> Result<String, ToolError> {
        self.run(&self.tools.eu_readelf, &[OsStr::new("-s"), file.as_os_str()])
    }

    fn demangle(&self, name: &str) -> Result<String, ToolError> {
        let output = self.run(&self.tools.cxxfilt, &[OsStr::new(name)])?;
        Ok(output.trim().to_owned())
    }
}

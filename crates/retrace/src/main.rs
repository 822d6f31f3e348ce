//! Retrace.
//!
//! Saves uReports, resolves their addresses against distribution debuginfo packages and clusters
//! them into problems. The storage is kept in memory for the duration of a single run.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod manifest;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            retrace_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

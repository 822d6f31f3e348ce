use std::io::{self, Read};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::ToolError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs `command` to completion and captures its output.
///
/// Stdout and stderr are drained on background threads so that a chatty tool cannot block on a
/// full pipe. If the tool has not exited after `timeout`, it is killed and
/// [`ToolError::Timeout`] is returned. A non-zero exit status is returned as
/// [`ToolError::Failed`] with the captured stderr.
pub fn run_with_timeout(
    tool: &str,
    mut command: Command,
    timeout: Duration,
) -> Result<Output, ToolError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.to_owned(),
        source,
    })?;

    let output = wait_with_timeout(tool, child, timeout)?;
    check_status(tool, output)
}

/// Waits at most `timeout` for an already spawned `child`.
///
/// Only the pipes that were configured as [`Stdio::piped`] are captured. On timeout the child is
/// killed and reaped.
pub fn wait_with_timeout(
    tool: &str,
    mut child: Child,
    timeout: Duration,
) -> Result<Output, ToolError> {
    let deadline = Instant::now() + timeout;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill(&mut child);
                return Err(ToolError::Wait {
                    tool: tool.to_owned(),
                    source,
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            kill(&mut child);
            tracing::debug!("{} killed after exceeding its deadline", tool);
            return Err(ToolError::Timeout {
                tool: tool.to_owned(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    };

    let map_err = |source| ToolError::Wait {
        tool: tool.to_owned(),
        source,
    };

    Ok(Output {
        status,
        stdout: collect(stdout).map_err(map_err)?,
        stderr: collect(stderr).map_err(map_err)?,
    })
}

/// Turns a non-zero exit status into [`ToolError::Failed`].
pub fn check_status(tool: &str, output: Output) -> Result<Output, ToolError> {
    if output.status.success() {
        return Ok(output);
    }

    Err(ToolError::Failed {
        tool: tool.to_owned(),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

fn kill(child: &mut Child) {
    // the child may have exited in the meantime
    child.kill().ok();
    child.wait().ok();
}

/// Reads `reader` to its end on a background thread.
pub fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

/// Waits for a reader started with [`drain`], returning nothing without one.
pub fn collect(handle: Option<JoinHandle<io::Result<Vec<u8>>>>) -> io::Result<Vec<u8>> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("output reader panicked"))?,
        None => Ok(Vec::new()),
    }
}

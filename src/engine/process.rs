use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::MigrateError;

/// Captured result of a finished tool process
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion with piped output.
///
/// Output is drained on helper threads while the child runs, so a chatty tool
/// can't block on a full pipe. With a timeout the child is killed and reaped
/// once the deadline passes.
pub fn run_tool(mut command: Command, timeout: Option<Duration>) -> Result<ToolOutput, MigrateError> {
    debug!("Running {:?}", command.get_program());

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            MigrateError::Engine(format!(
                "Failed to start {}: {}",
                command.get_program().to_string_lossy(),
                e
            ))
        })?;

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let status = wait_with_timeout(&mut child, timeout)?;

    let stdout = join_drain(stdout_reader);
    let stderr = join_drain(stderr_reader);

    match status {
        Some(status) => Ok(ToolOutput {
            status,
            stdout,
            stderr,
        }),
        None => Err(MigrateError::Engine(format!(
            "{} timed out after {} seconds",
            command.get_program().to_string_lossy(),
            timeout.map(|t| t.as_secs()).unwrap_or_default()
        ))),
    }
}

/// Polls the child until it exits. Returns None if it had to be killed.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<Option<ExitStatus>, MigrateError> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };

    let start = Instant::now();
    let poll_interval = Duration::from_millis(100);

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        if start.elapsed() >= timeout {
            warn!("Killing tool process {} after {:?}", child.id(), timeout);
            let _ = child.kill();
            // Reap to prevent a zombie
            let _ = child.wait();
            return Ok(None);
        }

        thread::sleep(poll_interval);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).ok();
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

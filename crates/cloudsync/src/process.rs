//! Timeout-bounded subprocess execution for the shell-based transport agent
//! (§5, "every Transport call carries a deadline; no unbounded waits").
//! `git` plumbing calls go through [`crate::git`] directly instead: those
//! are cheap, bounded-output calls, and the soft/hard timeout pair that
//! bounds a whole bundle/archive run (§4.6) is enforced one level up, by
//! the supervisor giving up on a worker thread rather than killing any one
//! subprocess (see `supervisor::Supervisor::hard_timeout_for_batch`).

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Result of a command execution with timeout bookkeeping.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run a command with an optional timeout, in `working_dir`, capturing
/// stdout/stderr. `timeout: None` runs to completion (used for cheap,
/// bounded git plumbing calls); callers enforcing the soft/hard cutoffs
/// (§4.6) always pass `Some(_)`.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let Some(timeout_dur) = timeout else {
        let output = command
            .output()
            .with_context(|| format!("failed to run command: {program} {args:?}"))?;
        return Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {program}"))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{program} timed out after {}",
                        humantime::format_duration(timeout_dur)
                    ));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

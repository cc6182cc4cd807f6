//! External program invocation.
//!
//! Every engine, synthesiser and encoder call goes through
//! [`ExternalCommand::run`]: spawn, wait up to a timeout, kill on expiry,
//! and turn a non-zero exit into a [`ProcessError`] carrying the tail of
//! stderr. Success additionally requires the expected output file to exist
//! with some content ([`ExternalCommand::run_expecting`]); several engines
//! exit 0 after silently failing to write anything.

use crate::config::CommandSpec;
use crate::error::ProcessError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 600;

/// A fully-specified external invocation.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl ExternalCommand {
    /// Start from a configured command line (program + fixed leading args).
    pub fn from_spec(spec: &CommandSpec) -> Self {
        Self {
            program: spec.program.clone(),
            args: spec.args.iter().map(OsString::from).collect(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Run to completion. The child and everything it started are killed
    /// if `timeout` elapses or the future is dropped.
    pub async fn run(&self, timeout: Duration) -> Result<(), ProcessError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }

        debug!("exec: {} {:?}", self.program, self.args);
        let start = Instant::now();

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let group = GroupGuard::new(child.id());

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                group.disarm();
                result.map_err(|source| ProcessError::Spawn {
                    program: self.program.clone(),
                    source,
                })?
            }
            Err(_) => {
                return Err(ProcessError::Timeout {
                    program: self.program.clone(),
                    secs: timeout.as_secs(),
                });
            }
        };

        debug!(
            "exit: {} → {} in {}ms",
            self.program,
            output.status,
            start.elapsed().as_millis()
        );

        if output.status.success() {
            Ok(())
        } else {
            Err(ProcessError::ExitStatus {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            })
        }
    }

    /// Run, then require `expected` to exist and be non-empty.
    pub async fn run_expecting(
        &self,
        timeout: Duration,
        expected: &Path,
    ) -> Result<PathBuf, ProcessError> {
        self.run(timeout).await?;
        let written = tokio::fs::metadata(expected)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if written {
            Ok(expected.to_path_buf())
        } else {
            Err(ProcessError::MissingOutput {
                program: self.program.clone(),
                expected: expected.to_path_buf(),
            })
        }
    }
}

/// Kills the child's process group on drop unless disarmed.
///
/// Wrapper scripts (`--homr-cmd "poetry run homr"`) fork the real engine;
/// `kill_on_drop` alone would only reach the wrapper.
struct GroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|id| i32::try_from(id).ok()).filter(|id| *id > 0),
        }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: kill(2) with a negative pid only signals the group the
            // child was spawned into; no memory is involved.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut cut = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("…{}", &text[cut..])
}

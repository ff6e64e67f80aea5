//! Subprocess execution shared by the CLI-backed adapters.
//!
//! Each child is spawned in its own process group so that cancelling a
//! step (timeout or user interrupt) terminates everything the tool forked,
//! not only the direct child.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AdapterError, AdapterResult, ExitInfo, Outcome};

/// Time between SIGTERM and SIGKILL for a cancelled process group
const TERM_GRACE: Duration = Duration::from_secs(2);

/// How often a signalled group is polled for exit
const EXIT_POLL: Duration = Duration::from_millis(50);

/// How long partial output is collected after a cancelled child is killed
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(1);

/// A fully described external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs [`CommandSpec`]s with output capture and group cancellation
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> AdapterResult {
        if cancel.is_cancelled() {
            return Err(AdapterError::cancelled(&spec.program));
        }

        debug!(command = %spec.display(), "Spawning");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(ref dir) = spec.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| AdapterError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| AdapterError::Spawn {
                program: spec.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                warn!(command = %spec.display(), "Cancelling subprocess group");
                terminate(&mut child).await;

                // Whatever the tool printed before it was stopped
                let stderr = collect(stderr, DRAIN_AFTER_KILL).await;
                stdout.abort();
                return Err(AdapterError::Cancelled {
                    program: spec.program.clone(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        let exit = match status.code() {
            Some(code) => ExitInfo::Code { code },
            None => ExitInfo::Signal,
        };

        Ok(Outcome {
            success: status.success(),
            exit,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buffer).await;
    }
    buffer
}

/// Output of a drain task, or whatever is left after `limit`
async fn collect(task: JoinHandle<Vec<u8>>, limit: Duration) -> Vec<u8> {
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(buffer)) => buffer,
        _ => Vec::new(),
    }
}

/// Stop the child and everything in its process group.
///
/// The group gets SIGTERM first; members still alive after [`TERM_GRACE`]
/// get SIGKILL. The direct child is reaped before returning.
#[cfg(unix)]
async fn terminate(child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    let group = Pid::from_raw(pid as i32);

    match killpg(group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            let _ = child.wait().await;
            return;
        }
        Err(e) => warn!(pid, error = %e, "Failed to signal process group"),
    }

    let deadline = tokio::time::Instant::now() + TERM_GRACE;
    loop {
        // Reap the leader so a zombie does not keep the group alive
        let _ = child.try_wait();
        if matches!(killpg(group, None), Err(Errno::ESRCH)) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    warn!(pid, "Process group ignored SIGTERM, sending SIGKILL");
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!(pid, error = %e, "Failed to kill process group");
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    let _ = child.kill().await;
}

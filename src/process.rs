/// Child process handle: spawn the server, check whether it is still running,
/// and stop it with SIGTERM, escalating to SIGKILL after a grace period.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// How long to wait for the kernel to reap a child after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while managing the server process.
#[derive(Debug)]
pub enum ProcessError {
    /// The OS refused to create the process (missing binary, permissions).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    Wait { source: std::io::Error },
    /// Delivering SIGTERM failed.
    Signal { pid: u32, source: Errno },
    /// Delivering SIGKILL failed.
    Kill { pid: u32, source: std::io::Error },
    /// The child was still not reaped after SIGKILL.
    Unreaped { pid: u32 },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            ProcessError::Wait { source } => {
                write!(f, "failed to wait for server process: {source}")
            }
            ProcessError::Signal { pid, source } => {
                write!(f, "failed to send SIGTERM to pid {pid}: {source}")
            }
            ProcessError::Kill { pid, source } => {
                write!(f, "failed to send SIGKILL to pid {pid}: {source}")
            }
            ProcessError::Unreaped { pid } => {
                write!(f, "pid {pid} did not exit after SIGKILL")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            ProcessError::Wait { source } => Some(source),
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::Kill { source, .. } => Some(source),
            ProcessError::Unreaped { .. } => None,
        }
    }
}

/// The lifecycle capability the supervisor needs from a running server.
///
/// A value of this type only exists once spawning succeeded; it moves from
/// running to exited either through `terminate` or because `is_alive`
/// observed the process dying on its own.
pub trait ServerProcess {
    fn pid(&self) -> u32;

    /// Monotonic instant the process was started.
    fn spawned_at(&self) -> Instant;

    /// Exit status, once the process has been reaped.
    fn exit_status(&self) -> Option<ExitStatus>;

    /// Non-blocking liveness check. Reaps and records the exit status if the
    /// process has already exited.
    fn is_alive(&mut self) -> bool;

    /// Stop the process and wait for it to be reaped. A no-op once exited.
    async fn terminate(&mut self) -> Result<(), ProcessError>;
}

/// Creates server processes from an argument vector (`args[0]` is the program).
pub trait Spawner {
    type Process: ServerProcess;

    fn spawn(&self, args: &[String]) -> Result<Self::Process, ProcessError>;
}

/// Spawns real OS processes through tokio.
#[derive(Debug, Clone)]
pub struct OsSpawner {
    terminate_grace: Duration,
}

impl OsSpawner {
    pub fn new(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }
}

impl Spawner for OsSpawner {
    type Process = OsProcess;

    /// The child gets its own process group so a terminal Ctrl-C reaches only
    /// the launcher, which then runs the normal termination path. stdin is
    /// closed; stdout/stderr are inherited so the server's own logs stay
    /// visible. Every other descriptor is opened close-on-exec by std.
    fn spawn(&self, args: &[String]) -> Result<OsProcess, ProcessError> {
        let (program, rest) = args.split_first().ok_or_else(|| ProcessError::Spawn {
            program: String::new(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argument vector",
            ),
        })?;

        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        // `id()` is only `None` after the child has been polled to completion,
        // which cannot have happened yet.
        let pid = child.id().unwrap_or(0);

        Ok(OsProcess {
            child,
            pid,
            spawned_at: Instant::now(),
            exit_status: None,
            terminate_grace: self.terminate_grace,
        })
    }
}

/// A real child process.
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
    pid: u32,
    spawned_at: Instant,
    exit_status: Option<ExitStatus>,
    terminate_grace: Duration,
}

impl OsProcess {
    fn record_exit(&mut self, status: ExitStatus) {
        tracing::debug!(pid = self.pid, status = %status, "server process reaped");
        self.exit_status = Some(status);
    }
}

impl ServerProcess for OsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                // Leave the verdict to `terminate`, which reports real failures.
                tracing::warn!(pid = self.pid, error = %e, "failed to poll server process");
                true
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Ok(());
        }

        let pid = self.pid;
        tracing::info!(
            pid,
            grace_secs = self.terminate_grace.as_secs_f64(),
            "sending SIGTERM to server"
        );
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            // ESRCH: exited between the liveness check and the signal; the
            // wait below reaps it.
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(ProcessError::Signal { pid, source: e }),
        }

        match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                return Ok(());
            }
            Ok(Err(e)) => return Err(ProcessError::Wait { source: e }),
            Err(_) => {
                tracing::warn!(pid, "server ignored SIGTERM, sending SIGKILL");
            }
        }

        self.child
            .start_kill()
            .map_err(|e| ProcessError::Kill { pid, source: e })?;

        match tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                Ok(())
            }
            Ok(Err(e)) => Err(ProcessError::Wait { source: e }),
            Err(_) => Err(ProcessError::Unreaped { pid }),
        }
    }
}

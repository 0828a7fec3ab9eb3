/// Supervisor: spawn the server, hand it to the idle controller, and make sure
/// it is stopped before returning, including when the launcher itself is
/// asked to shut down.
use crate::config::ServerConfig;
use crate::controller::{IdleController, Outcome};
use crate::probe::ActivityProbe;
use crate::process::{ProcessError, ServerProcess, Spawner};
use crate::status::StatusTracker;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Failures that end a run with a non-zero exit status.
#[derive(Debug)]
pub enum SupervisorError {
    /// The server process could not be created.
    Spawn(ProcessError),
    /// The server started but died inside the startup grace window.
    EarlyExit { status: Option<ExitStatus> },
    /// The server could not be stopped, not even with SIGKILL.
    Termination(ProcessError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn(e) => write!(f, "server failed to start: {e}"),
            SupervisorError::EarlyExit { status: Some(status) } => {
                write!(f, "server exited early with {status}")
            }
            SupervisorError::EarlyExit { status: None } => {
                write!(f, "server exited early with unknown status")
            }
            SupervisorError::Termination(e) => write!(f, "failed to stop server: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn(e) | SupervisorError::Termination(e) => Some(e),
            SupervisorError::EarlyExit { .. } => None,
        }
    }
}

pub struct Supervisor {
    config: ServerConfig,
    status_path: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status_path: None,
        }
    }

    /// Keep a status file at `path` for the duration of the run.
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    /// Spawn the server and supervise it until it is idle, dies, or
    /// `shutdown` resolves. Whatever ends the run, the server has exited by
    /// the time this returns `Ok`.
    pub async fn run<S, P, F>(
        &self,
        spawner: &S,
        probe: P,
        shutdown: F,
    ) -> Result<Outcome, SupervisorError>
    where
        S: Spawner,
        P: ActivityProbe,
        F: Future<Output = ()>,
    {
        tracing::info!(
            executable = %self.config.executable(),
            command = %self.config.command_line(),
            "spawning server"
        );
        let mut child = spawner.spawn(self.config.args()).map_err(|e| {
            tracing::error!(error = %e, "failed to spawn server");
            SupervisorError::Spawn(e)
        })?;
        let pid = child.pid();
        tracing::info!(pid, port = self.config.port(), "server started");

        let mut controller = IdleController::new(probe, &self.config, child.spawned_at());
        if let Some(path) = &self.status_path {
            controller = controller.with_status(StatusTracker::new(
                path.clone(),
                pid,
                self.config.port(),
                self.config.idle_timeout(),
            ));
        }

        tokio::pin!(shutdown);
        let finished = tokio::select! {
            result = controller.run(&mut child) => Some(result),
            _ = &mut shutdown => None,
        };

        let outcome = match finished {
            Some(result) => result?,
            None => {
                tracing::warn!(pid, "shutdown requested, stopping server");
                controller.stop(&mut child).await?;
                Outcome::Interrupted
            }
        };

        controller.clear_status();
        tracing::info!(pid, outcome = ?outcome, "server stopped");
        Ok(outcome)
    }
}

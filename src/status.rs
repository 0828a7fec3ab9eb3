/// Status file: a JSON snapshot of the launcher, rewritten on every controller
/// transition so `lama-launcher --status` can report on a running instance.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Controller states, as written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Spawned, inside the startup grace window.
    Starting,
    /// Polling for activity.
    Monitoring,
    /// Shutdown initiated, waiting for the server to exit.
    Terminating,
    /// Server exited; the run is over.
    Stopped,
    /// Server died during startup or could not be reaped.
    Failed,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerState::Starting => "starting",
            ControllerState::Monitoring => "monitoring",
            ControllerState::Terminating => "terminating",
            ControllerState::Stopped => "stopped",
            ControllerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub launcher_pid: u32,
    pub server_pid: u32,
    pub state: ControllerState,
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "status".to_string());
        let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read the status file. `Ok(None)` when no launcher has written one.
    pub fn read(&self) -> Result<Option<StatusData>, StatusError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StatusError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Path to the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Builds StatusData for one supervised server and writes it on each update.
pub struct StatusTracker {
    file: StatusFile,
    launcher_pid: u32,
    server_pid: u32,
    port: u16,
    idle_timeout: Duration,
    started_at: DateTime<Utc>,
}

impl StatusTracker {
    /// Create a tracker for a server that was just spawned.
    pub fn new(status_path: PathBuf, server_pid: u32, port: u16, idle_timeout: Duration) -> Self {
        Self {
            file: StatusFile::new(status_path),
            launcher_pid: std::process::id(),
            server_pid,
            port,
            idle_timeout,
            started_at: Utc::now(),
        }
    }

    /// Write the status file. `idle_for` is how long ago activity was last seen.
    pub fn update(&self, state: ControllerState, idle_for: Duration) {
        let now = Utc::now();
        let idle_for = chrono::Duration::from_std(idle_for).unwrap_or(chrono::Duration::zero());
        let data = StatusData {
            launcher_pid: self.launcher_pid,
            server_pid: self.server_pid,
            state,
            port: self.port,
            idle_timeout_secs: self.idle_timeout.as_secs(),
            started_at: self.started_at,
            last_activity: now - idle_for,
            last_update: now,
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Remove the status file.
    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Render a status snapshot for `--status`.
pub fn describe(data: &StatusData, now: DateTime<Utc>) -> String {
    let idle = (now - data.last_activity).num_seconds().max(0);
    format!(
        "launcher pid {}: server pid {} on port {} is {}\n\
         started:       {}\n\
         last activity: {} ({idle}s ago, idle timeout {}s)\n\
         last update:   {}",
        data.launcher_pid,
        data.server_pid,
        data.port,
        data.state,
        data.started_at.to_rfc3339(),
        data.last_activity.to_rfc3339(),
        data.idle_timeout_secs,
        data.last_update.to_rfc3339(),
    )
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Parse { path, source } => {
                write!(f, "malformed status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Parse { source, .. } => Some(source),
        }
    }
}

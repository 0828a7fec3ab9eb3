use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from launcher.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LauncherConfig {
    pub server: ServerSection,
    pub idle: IdleConfig,
    pub shutdown: ShutdownConfig,
    pub status: StatusConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub executable: String,
    pub model_dir: PathBuf,
    pub model_path: PathBuf,
    pub gpu_layers: u32,
    pub context_size: u32,
    pub host: String,
    pub port: u16,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub startup_grace_ms: u64,
    pub terminate_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub tables: Vec<PathBuf>,
}

// --- Default implementations ---

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            executable: "llama-server".to_string(),
            model_dir: PathBuf::from("models"),
            model_path: PathBuf::from(
                "qwen/Qwen_Qwen2.5-Coder-1.5B-Instruct-GGUF_qwen2.5-coder-1.5b-instruct-q4_k_m.gguf",
            ),
            gpu_layers: 99,
            context_size: 2048,
            host: "0.0.0.0".to_string(),
            port: 8080,
            extra_args: Vec::new(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: 1000,
            terminate_grace_secs: 10,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(".lama-launcher.status"),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tables: vec![
                PathBuf::from("/proc/net/tcp"),
                PathBuf::from("/proc/net/tcp6"),
            ],
        }
    }
}

/// Errors that can occur while loading or resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A relative model directory needs `$HOME` to resolve against.
    NoHome,
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::NoHome => {
                write!(f, "HOME is not set; cannot resolve a relative model_dir")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NoHome | ConfigError::Invalid(_) => None,
        }
    }
}

impl LauncherConfig {
    /// Load config from `path`. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolve into launch parameters, using `$HOME` for a relative model dir.
    pub fn resolve(&self) -> Result<ServerConfig, ConfigError> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        self.resolve_with_home(home.as_deref())
    }

    /// Resolve into launch parameters against an explicit home directory.
    pub fn resolve_with_home(&self, home: Option<&Path>) -> Result<ServerConfig, ConfigError> {
        let server = &self.server;
        if server.executable.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server.executable must not be empty".to_string(),
            ));
        }
        if self.idle.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "idle.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.idle.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle.poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        let idle_timeout = Duration::from_secs(self.idle.timeout_secs);
        let poll_interval = Duration::from_millis(self.idle.poll_interval_ms);
        if poll_interval >= idle_timeout {
            return Err(ConfigError::Invalid(format!(
                "idle.poll_interval_ms ({}) must be shorter than idle.timeout_secs ({})",
                self.idle.poll_interval_ms, self.idle.timeout_secs
            )));
        }

        let model_path = resolve_model_path(&server.model_dir, &server.model_path, home)?;

        let mut args = vec![
            server.executable.clone(),
            "-m".to_string(),
            model_path.display().to_string(),
            "-ngl".to_string(),
            server.gpu_layers.to_string(),
            "-c".to_string(),
            server.context_size.to_string(),
            "--host".to_string(),
            server.host.clone(),
            "--port".to_string(),
            server.port.to_string(),
        ];
        args.extend(server.extra_args.iter().cloned());

        Ok(ServerConfig {
            args,
            port: server.port,
            idle_timeout,
            poll_interval,
            startup_grace: Duration::from_millis(self.shutdown.startup_grace_ms),
            terminate_grace: Duration::from_secs(self.shutdown.terminate_grace_secs),
        })
    }
}

/// `model_path` wins when absolute; otherwise it lives under `model_dir`,
/// which in turn lives under `home` when relative.
fn resolve_model_path(
    model_dir: &Path,
    model_path: &Path,
    home: Option<&Path>,
) -> Result<PathBuf, ConfigError> {
    if model_path.is_absolute() {
        return Ok(model_path.to_path_buf());
    }
    let dir = if model_dir.is_absolute() {
        model_dir.to_path_buf()
    } else {
        home.ok_or(ConfigError::NoHome)?.join(model_dir)
    };
    Ok(dir.join(model_path))
}

/// Resolved, immutable launch parameters for one supervised server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Full argument vector; `args[0]` is the executable.
    args: Vec<String>,
    port: u16,
    idle_timeout: Duration,
    poll_interval: Duration,
    startup_grace: Duration,
    terminate_grace: Duration,
}

impl ServerConfig {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn executable(&self) -> &str {
        &self.args[0]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn startup_grace(&self) -> Duration {
        self.startup_grace
    }

    pub fn terminate_grace(&self) -> Duration {
        self.terminate_grace
    }

    /// Shell-ish rendering of the command line, for logs and `--dry-run`.
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Build a config directly from parts, bypassing file resolution.
    pub fn for_test(
        args: Vec<String>,
        port: u16,
        idle_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        assert!(!args.is_empty(), "argument vector must include the executable");
        Self {
            args,
            port,
            idle_timeout,
            poll_interval,
            startup_grace: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(2),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }
}

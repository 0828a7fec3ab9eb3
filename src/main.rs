mod config;
mod controller;
mod probe;
mod process;
mod signals;
mod status;
mod supervisor;
#[cfg(test)]
mod testing;

use clap::Parser;
use config::LauncherConfig;
use controller::Outcome;
use probe::ProcNetTcp;
use process::OsSpawner;
use signals::SignalHandler;
use status::StatusFile;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;

/// Starts llama-server, watches its port for client connections, and stops
/// it again after a period with no activity.
#[derive(Parser, Debug)]
#[command(name = "lama-launcher", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "launcher.toml")]
    config: PathBuf,

    /// Server port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Model file (overrides config; relative paths resolve under model_dir)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Idle timeout in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    poll_interval: Option<u64>,

    /// Validate config and print the resolved command line, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the state of a running launcher and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (every poll, every timer reset)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut LauncherConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(model) = &self.model {
            config.server.model_path = model.clone();
        }
        if let Some(secs) = self.idle_timeout {
            config.idle.timeout_secs = secs;
        }
        if let Some(ms) = self.poll_interval {
            config.idle.poll_interval_ms = ms;
        }
    }

    fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.default_log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn print_status(path: PathBuf) -> ExitCode {
    let file = StatusFile::new(path);
    match file.read() {
        Ok(Some(data)) => {
            println!("{}", status::describe(&data, chrono::Utc::now()));
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("No launcher running (no status file at {})", file.path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot read status");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match LauncherConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    if cli.status {
        return print_status(config.status.file.clone());
    }

    let server = match config.resolve() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        println!("lama-launcher v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file:   {}", cli.config.display());
        println!("Command:       {}", server.command_line());
        println!("Port:          {}", server.port());
        println!("Idle timeout:  {}s", server.idle_timeout().as_secs());
        println!("Poll interval: {}ms", server.poll_interval().as_millis());
        println!("Dry run mode: config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let mut signals = match SignalHandler::install() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };
    let shutdown = async move {
        let signal = signals.recv().await;
        tracing::info!(%signal, "received shutdown signal");
    };

    let spawner = OsSpawner::new(server.terminate_grace());
    let probe = ProcNetTcp::new(config.probe.tables.clone());
    let supervisor = Supervisor::new(server).with_status_file(config.status.file.clone());

    match supervisor.run(&spawner, probe, shutdown).await {
        Ok(outcome) => {
            match outcome {
                Outcome::IdleTimeout { idle_for } => {
                    tracing::info!(idle_secs = idle_for.as_secs(), "shut down after idle timeout")
                }
                Outcome::ChildExited { status } => {
                    tracing::info!(status = ?status, "server is gone, nothing left to supervise")
                }
                Outcome::Interrupted => tracing::info!("shut down on request"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "launcher failed");
            ExitCode::FAILURE
        }
    }
}

/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C), SIGTERM and SIGHUP all mean the same thing: stop the
/// server, wait for it to exit, then exit the launcher. The server runs in its
/// own process group, so it never sees the terminal's Ctrl-C directly.
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Which signal asked the launcher to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
        };
        f.write_str(name)
    }
}

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl SignalHandler {
    /// Register the handlers. Must be called before the server is spawned so
    /// a signal arriving during startup is not lost.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.hangup.recv() => ShutdownSignal::Hangup,
        }
    }
}

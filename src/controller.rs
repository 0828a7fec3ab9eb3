/// Idle timeout controller.
///
/// Runs alongside the server process, polling the activity probe once per
/// poll interval. Every observed connection resets the idle timer; once no
/// activity has been seen for longer than the idle threshold the server is
/// terminated.
use crate::config::ServerConfig;
use crate::probe::ActivityProbe;
use crate::process::ServerProcess;
use crate::status::{ControllerState, StatusTracker};
use crate::supervisor::SupervisorError;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// How a supervised run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No activity for longer than the idle threshold; the server was stopped.
    IdleTimeout { idle_for: Duration },
    /// The server exited on its own after startup.
    ChildExited { status: Option<ExitStatus> },
    /// The launcher was asked to stop; the server was stopped first.
    Interrupted,
}

/// Per-controller idle timer. All instants are monotonic.
#[derive(Debug, Clone)]
pub struct ActivityState {
    last_activity: Instant,
    idle_threshold: Duration,
    poll_interval: Duration,
}

impl ActivityState {
    pub fn new(started_at: Instant, idle_threshold: Duration, poll_interval: Duration) -> Self {
        Self {
            last_activity: started_at,
            idle_threshold,
            poll_interval,
        }
    }

    /// Reset the timer to `now`. Never moves it backwards.
    pub fn record_activity(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Strictly longer than the threshold; equal is still within budget.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.idle_for(now) > self.idle_threshold
    }

    #[allow(dead_code)]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Drives one server from startup check to termination.
pub struct IdleController<P> {
    probe: P,
    port: u16,
    startup_grace: Duration,
    activity: ActivityState,
    state: ControllerState,
    was_active: bool,
    status: Option<StatusTracker>,
}

impl<P: ActivityProbe> IdleController<P> {
    /// `started_at` is the server's spawn instant: a server nobody ever
    /// connects to is stopped one idle threshold after it was launched.
    pub fn new(probe: P, config: &ServerConfig, started_at: Instant) -> Self {
        Self {
            probe,
            port: config.port(),
            startup_grace: config.startup_grace(),
            activity: ActivityState::new(
                started_at,
                config.idle_timeout(),
                config.poll_interval(),
            ),
            state: ControllerState::Starting,
            was_active: false,
            status: None,
        }
    }

    pub fn with_status(mut self, tracker: StatusTracker) -> Self {
        self.status = Some(tracker);
        self
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    #[allow(dead_code)]
    pub fn activity(&self) -> &ActivityState {
        &self.activity
    }

    #[allow(dead_code)]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Move to `state` and record it in the status file.
    pub fn transition(&mut self, state: ControllerState) {
        if state != self.state {
            tracing::debug!(from = %self.state, to = %state, "controller transition");
        }
        self.state = state;
        self.write_status();
    }

    fn write_status(&self) {
        if let Some(tracker) = &self.status {
            tracker.update(self.state, self.activity.idle_for(Instant::now()));
        }
    }

    /// Drop the status file after a clean run.
    pub fn clear_status(&self) {
        if let Some(tracker) = &self.status {
            tracker.remove();
        }
    }

    /// One monitoring step at `now`: probe, refresh the timer on activity,
    /// and move to `Terminating` once the idle threshold is exceeded.
    pub fn observe(&mut self, now: Instant) -> ControllerState {
        let active = self.probe.has_active_connection(self.port);
        if active {
            self.activity.record_activity(now);
            if self.was_active {
                tracing::debug!(port = self.port, "activity seen, idle timer reset");
            } else {
                tracing::info!(port = self.port, "client activity detected");
                self.write_status();
            }
        }
        self.was_active = active;

        if self.activity.is_expired(now) {
            self.transition(ControllerState::Terminating);
        }
        self.state
    }

    /// Run the full state machine against `child`.
    ///
    /// Returns `EarlyExit` if the server dies inside the startup grace window,
    /// `Termination` if it cannot be stopped. Otherwise the outcome says why
    /// monitoring ended; in every case the server has exited on return.
    pub async fn run<C: ServerProcess>(
        &mut self,
        child: &mut C,
    ) -> Result<Outcome, SupervisorError> {
        let pid = child.pid();
        self.transition(ControllerState::Starting);

        tokio::time::sleep(self.startup_grace).await;
        if !child.is_alive() {
            self.transition(ControllerState::Failed);
            let status = child.exit_status();
            tracing::error!(
                pid,
                status = ?status,
                "server exited during startup; check the model path and server flags"
            );
            return Err(SupervisorError::EarlyExit { status });
        }

        self.transition(ControllerState::Monitoring);
        tracing::info!(
            pid,
            port = self.port,
            idle_timeout_secs = self.activity.idle_threshold().as_secs(),
            "server is up, watching for connections"
        );

        let mut ticker = tokio::time::interval(self.activity.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let now = ticker.tick().await;

            if !child.is_alive() {
                let status = child.exit_status();
                tracing::warn!(pid, status = ?status, "server exited on its own");
                self.transition(ControllerState::Stopped);
                return Ok(Outcome::ChildExited { status });
            }

            if self.observe(now) == ControllerState::Terminating {
                break;
            }
        }

        let idle_for = self.activity.idle_for(Instant::now());
        tracing::info!(
            pid,
            idle_secs = idle_for.as_secs(),
            "idle timeout reached, stopping server"
        );
        self.stop(child).await?;
        Ok(Outcome::IdleTimeout { idle_for })
    }

    /// Terminate `child` and settle in `Stopped`, or `Failed` if it could not
    /// be reaped.
    pub async fn stop<C: ServerProcess>(&mut self, child: &mut C) -> Result<(), SupervisorError> {
        self.transition(ControllerState::Terminating);
        if let Err(e) = child.terminate().await {
            self.transition(ControllerState::Failed);
            return Err(SupervisorError::Termination(e));
        }
        self.transition(ControllerState::Stopped);
        Ok(())
    }
}

//! Test doubles for the process and probe capabilities.
use crate::probe::ActivityProbe;
use crate::process::{ProcessError, ServerProcess, Spawner};
use std::cell::{Cell, RefCell};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

/// Everything a fake process did, shared with the test that created it.
#[derive(Debug, Default)]
pub struct FakeLog {
    pub spawned: Vec<Vec<String>>,
    pub terminate_calls: u32,
    pub signals_sent: u32,
    pub terminated_at: Option<Instant>,
}

/// How a fake process behaves once spawned.
#[derive(Debug, Clone, Copy)]
pub enum FakeBehavior {
    /// Runs until terminated.
    LongLived,
    /// Exits on its own with `code` after `after`.
    ExitsAfter { after: Duration, code: i32 },
    /// Survives every termination attempt.
    Unkillable,
    /// Spawning fails as if the binary were missing.
    SpawnFails,
}

pub struct FakeSpawner {
    behavior: FakeBehavior,
    log: Rc<RefCell<FakeLog>>,
}

impl FakeSpawner {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            log: Rc::new(RefCell::new(FakeLog::default())),
        }
    }

    pub fn log(&self) -> Rc<RefCell<FakeLog>> {
        Rc::clone(&self.log)
    }
}

impl Spawner for FakeSpawner {
    type Process = FakeProcess;

    fn spawn(&self, args: &[String]) -> Result<FakeProcess, ProcessError> {
        if let FakeBehavior::SpawnFails = self.behavior {
            return Err(ProcessError::Spawn {
                program: args.first().cloned().unwrap_or_default(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        self.log.borrow_mut().spawned.push(args.to_vec());
        Ok(FakeProcess::new(self.behavior, Rc::clone(&self.log)))
    }
}

pub struct FakeProcess {
    behavior: FakeBehavior,
    spawned_at: Instant,
    exit_status: Option<ExitStatus>,
    log: Rc<RefCell<FakeLog>>,
}

impl FakeProcess {
    pub fn new(behavior: FakeBehavior, log: Rc<RefCell<FakeLog>>) -> Self {
        Self {
            behavior,
            spawned_at: Instant::now(),
            exit_status: None,
            log,
        }
    }
}

impl ServerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        4242
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
        if let FakeBehavior::ExitsAfter { after, code } = self.behavior {
            if Instant::now() >= self.spawned_at + after {
                self.exit_status = Some(ExitStatus::from_raw(code << 8));
                return false;
            }
        }
        true
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        let mut log = self.log.borrow_mut();
        log.terminate_calls += 1;
        drop(log);

        if !self.is_alive() {
            return Ok(());
        }

        let mut log = self.log.borrow_mut();
        log.signals_sent += 1;
        if let FakeBehavior::Unkillable = self.behavior {
            return Err(ProcessError::Unreaped { pid: 4242 });
        }
        log.terminated_at = Some(Instant::now());
        // Raw wait status for "killed by SIGTERM".
        self.exit_status = Some(ExitStatus::from_raw(15));
        Ok(())
    }
}

/// Probe that replays a fixed script of answers, then falls back to `default`.
pub struct ScriptedProbe {
    script: Vec<bool>,
    default: bool,
    calls: Cell<usize>,
    ports: RefCell<Vec<u16>>,
}

impl ScriptedProbe {
    pub fn new(script: Vec<bool>, default: bool) -> Self {
        Self {
            script,
            default,
            calls: Cell::new(0),
            ports: RefCell::new(Vec::new()),
        }
    }

    /// Active for the first `n` polls, idle afterwards.
    pub fn active_for(n: usize) -> Self {
        Self::new(vec![true; n], false)
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.borrow().clone()
    }
}

impl ActivityProbe for ScriptedProbe {
    fn has_active_connection(&self, port: u16) -> bool {
        let n = self.calls.get();
        self.calls.set(n + 1);
        self.ports.borrow_mut().push(port);
        self.script.get(n).copied().unwrap_or(self.default)
    }
}

impl<P: ActivityProbe> ActivityProbe for Rc<P> {
    fn has_active_connection(&self, port: u16) -> bool {
        (**self).has_active_connection(port)
    }
}

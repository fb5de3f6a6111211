//! The worker process supervisor.
//!
//! Maintains a fixed table of worker slots, each backed by an isolated OS
//! process running its own runtime and accept loop. A heartbeat reaps dead
//! children without blocking and respawns at most one worker per tick, so a
//! persistently failing fleet cannot turn into a fork storm. A slot that
//! crashes more than `max_errors` times within `error_period_secs` trips the
//! circuit breaker and takes the whole supervisor down.

use std::time::{Duration, Instant};

use postrider_common::{Signal, internal};
use serde::Deserialize;
use tokio::{
    process::{Child, Command},
    sync::broadcast,
};

use crate::{error::SupervisorError, slot::WorkerSlot};

/// Supervisor tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Number of worker slots.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Crashes tolerated per slot within the error period. One more trips
    /// the circuit breaker.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Length of the per-slot error window in seconds.
    #[serde(default = "default_error_period_secs")]
    pub error_period_secs: u64,

    /// How long workers get to exit after SIGTERM before SIGKILL.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

const fn default_workers() -> u32 {
    4
}

const fn default_heartbeat_secs() -> u64 {
    1
}

const fn default_max_errors() -> u32 {
    5
}

const fn default_error_period_secs() -> u64 {
    30
}

const fn default_grace_secs() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            heartbeat_secs: default_heartbeat_secs(),
            max_errors: default_max_errors(),
            error_period_secs: default_error_period_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

type CommandFactory = Box<dyn Fn(u32) -> Command + Send + Sync>;

/// The supervisor process body.
pub struct Supervisor {
    config: SupervisorConfig,
    factory: CommandFactory,
    slots: Vec<WorkerSlot>,
    children: Vec<Option<Child>>,
    heartbeat: Duration,
}

impl Supervisor {
    /// Creates a supervisor whose workers are re-executions of the current
    /// binary with `worker --slot N`. Each child builds its own runtime from
    /// scratch; nothing of the parent's event state is inherited.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable path cannot be determined.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe()?;

        Ok(Self::with_command_factory(
            config,
            Box::new(move |slot| {
                let mut command = Command::new(&exe);
                command.arg("worker").arg("--slot").arg(slot.to_string());
                command
            }),
        ))
    }

    /// Creates a supervisor with an explicit worker command factory.
    #[must_use]
    pub fn with_command_factory(config: SupervisorConfig, factory: CommandFactory) -> Self {
        let workers = config.workers as usize;
        let heartbeat = Duration::from_secs(config.heartbeat_secs);

        Self {
            config,
            factory,
            slots: (0..workers).map(|id| WorkerSlot::new(id as u32)).collect(),
            children: (0..workers).map(|_| None).collect(),
            heartbeat,
        }
    }

    /// Overrides the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Number of slots currently marked alive.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.alive).count()
    }

    /// Runs the supervisor until a shutdown signal arrives or the circuit
    /// breaker trips. Either way every worker has been terminated when this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::CircuitBreaker` if a slot crashed its way
    /// through the error window, or a spawn error from initial startup.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SupervisorError> {
        internal!(
            level = INFO,
            "Supervisor starting {} worker(s)",
            self.config.workers
        );

        for id in 0..self.config.workers {
            self.spawn_worker(id)?;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(err) = self.tick() {
                        internal!(level = ERROR, "{err}, shutting down all workers");
                        self.shutdown_workers().await;
                        return Err(err);
                    }
                }

                _ = shutdown.recv() => {
                    internal!(level = INFO, "Supervisor shutting down");
                    self.shutdown_workers().await;
                    return Ok(());
                }
            }
        }
    }

    /// One heartbeat: reap exited children, then respawn at most one slot.
    fn tick(&mut self) -> Result<(), SupervisorError> {
        self.reap()?;
        self.respawn_one();
        Ok(())
    }

    /// Non-blocking reap of every child, mapping exits back to slots.
    fn reap(&mut self) -> Result<(), SupervisorError> {
        let error_period = Duration::from_secs(self.config.error_period_secs);

        for (id, held) in self.children.iter_mut().enumerate() {
            let Some(child) = held.as_mut() else {
                continue;
            };

            match child.try_wait() {
                Ok(Some(status)) => {
                    let slot = &mut self.slots[id];
                    let pid = slot.pid;
                    slot.mark_exited();
                    *held = None;

                    if status.success() {
                        internal!(level = INFO, "Worker {id} (pid {pid:?}) exited cleanly");
                    } else {
                        let count = slot.record_error(error_period);
                        internal!(
                            level = WARN,
                            "Worker {id} (pid {pid:?}) exited abnormally ({status}), \
                             error {count} in window"
                        );

                        if count > self.config.max_errors {
                            return Err(SupervisorError::CircuitBreaker {
                                slot: id as u32,
                                max_errors: self.config.max_errors,
                                period_secs: self.config.error_period_secs,
                            });
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    internal!(level = ERROR, "Failed to poll worker {id}: {err}");
                }
            }
        }

        Ok(())
    }

    /// Respawns the first dead slot, if any. One per tick.
    fn respawn_one(&mut self) {
        let Some(id) = self.slots.iter().position(|slot| !slot.alive) else {
            return;
        };

        #[allow(clippy::cast_possible_truncation)]
        if let Err(err) = self.spawn_worker(id as u32) {
            internal!(level = ERROR, "Respawn of worker {id} failed: {err}");
            let error_period = Duration::from_secs(self.config.error_period_secs);
            self.slots[id].record_error(error_period);
        }
    }

    fn spawn_worker(&mut self, id: u32) -> Result<(), SupervisorError> {
        let mut command = (self.factory)(id);
        let child = command
            .spawn()
            .map_err(|source| SupervisorError::SpawnFailed { slot: id, source })?;

        let pid = child.id().unwrap_or_default();
        self.slots[id as usize].mark_spawned(pid);
        self.children[id as usize] = Some(child);

        internal!(level = INFO, "Spawned worker {id} (pid {pid})");
        Ok(())
    }

    /// Graceful stop: SIGTERM every alive worker, wait out the grace timer,
    /// SIGKILL whatever is left.
    async fn shutdown_workers(&mut self) {
        for slot in self.slots.iter().filter(|slot| slot.alive) {
            if let Some(pid) = slot.pid {
                // SAFETY: sending a signal to our own child process
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.grace_secs);

        while self.children.iter().any(Option::is_some) {
            for (id, held) in self.children.iter_mut().enumerate() {
                let Some(child) = held.as_mut() else {
                    continue;
                };
                if let Ok(Some(_)) = child.try_wait() {
                    self.slots[id].mark_exited();
                    *held = None;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (id, held) in self.children.iter_mut().enumerate() {
            let Some(mut child) = held.take() else {
                continue;
            };

            internal!(level = WARN, "Worker {id} did not stop in time, killing");
            if let Err(err) = child.kill().await {
                internal!(level = ERROR, "Failed to kill worker {id}: {err}");
            }
            self.slots[id].mark_exited();
        }
    }
}

/// Drops process privileges to the configured ids, group first.
///
/// Called in the worker after spawn, before serving. A worker that cannot
/// shed privileges must not serve traffic.
///
/// # Errors
///
/// Returns an error if either id change is refused by the OS.
pub fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> Result<(), SupervisorError> {
    if let Some(gid) = gid {
        // SAFETY: setgid has no memory-safety preconditions
        let rc = unsafe { libc::setgid(gid) };
        if rc != 0 {
            return Err(SupervisorError::PrivilegeDrop(format!(
                "setgid({gid}): {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    if let Some(uid) = uid {
        // SAFETY: setuid has no memory-safety preconditions
        let rc = unsafe { libc::setuid(uid) };
        if rc != 0 {
            return Err(SupervisorError::PrivilegeDrop(format!(
                "setuid({uid}): {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

//! Supervisor-mode entry point and process-wide shutdown plumbing.

use std::{path::PathBuf, sync::LazyLock};

use postrider_common::{Signal, internal};
use postrider_supervisor::Supervisor;
use tokio::{signal::unix::SignalKind, sync::broadcast};

use crate::config::Config;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Waits for CTRL+C or SIGTERM and broadcasts the shutdown signal.
pub async fn watch_signals() {
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            internal!(level = ERROR, "Unable to install SIGTERM handler: {err}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down ...");
        }
        _ = sigterm.recv() => {
            internal!("SIGTERM received, shutting down ...");
        }
    }

    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
}

/// The supervisor process: spawns and tends the worker fleet.
pub struct Controller {
    config: Config,
    config_path: PathBuf,
}

impl Controller {
    #[must_use]
    pub const fn new(config: Config, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Runs the supervisor until shutdown or until the crash circuit breaker
    /// trips.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located, if a
    /// worker cannot be spawned at startup, or if the circuit breaker trips.
    pub async fn run(self) -> anyhow::Result<()> {
        internal!(level = INFO, "Controller running");

        let exe = std::env::current_exe()?;
        let config_path = self.config_path;

        let supervisor = Supervisor::with_command_factory(
            self.config.supervisor,
            Box::new(move |slot| {
                let mut command = tokio::process::Command::new(&exe);
                command
                    .arg("--config")
                    .arg(&config_path)
                    .arg("worker")
                    .arg("--slot")
                    .arg(slot.to_string());
                command
            }),
        );

        tokio::spawn(watch_signals());
        supervisor.run(SHUTDOWN_BROADCAST.subscribe()).await?;

        internal!("Shutting down...");
        Ok(())
    }
}

#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

use std::{path::PathBuf, process};

use clap::{Parser, Subcommand};
use postrider::{Config, Controller, find_config_file};
use postrider_supervisor::ExitStatus;

#[derive(Parser)]
#[command(name = "postrider", version, about = "A store-and-forward SMTP relay daemon")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a single worker slot (normally spawned by the supervisor)
    #[command(hide = true)]
    Worker {
        /// Slot index assigned by the supervisor
        #[arg(long)]
        slot: u32,
    },
}

fn main() {
    let cli = Cli::parse();
    postrider_common::logging::init();

    match cli.command {
        Some(Mode::Worker { slot }) => worker_main(cli.config, slot),
        None => supervisor_main(cli.config),
    }
}

fn load_config(config_arg: Option<PathBuf>) -> anyhow::Result<(PathBuf, Config)> {
    let path = config_arg.map_or_else(find_config_file, Ok)?;
    let config = Config::load(&path)?;
    Ok((path, config))
}

fn supervisor_main(config_arg: Option<PathBuf>) -> ! {
    let (path, config) = match load_config(config_arg) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(1);
        }
    };

    let Ok(runtime) = runtime() else {
        process::exit(ExitStatus::ReactorInit.code());
    };

    match runtime.block_on(Controller::new(config, path).run()) {
        Ok(()) => process::exit(0),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(1);
        }
    }
}

fn worker_main(config_arg: Option<PathBuf>, slot: u32) -> ! {
    let (_path, config) = match load_config(config_arg) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(ExitStatus::WorkerConfig.code());
        }
    };

    // Workers build their own runtime from scratch; failing to do so is a
    // distinct condition from the supervisor failing at startup
    let Ok(runtime) = runtime() else {
        process::exit(ExitStatus::ReactorReinit.code());
    };

    match runtime.block_on(postrider::worker::run(config, slot)) {
        Ok(()) => process::exit(0),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(ExitStatus::WorkerEntry.code());
        }
    }
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .inspect_err(|err| eprintln!("Failed to build runtime: {err}"))
}

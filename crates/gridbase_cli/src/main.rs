//! gridbase command-line entry point.
//!
//! # Responsibility
//! - Load `CoreConfig` from `GRIDBASE_*` variables and initialize logging.
//! - Run the notification scheduler against the configured database.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use gridbase_core::{
    core_version, init_logging_from_config, open_db, ping, CoreConfig, NotificationScheduler,
    OutboxDispatcher,
};
use log::{error, info};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command();

    if command == Command::Ping {
        println!("gridbase_core ping={}", ping());
        println!("gridbase_core version={}", core_version());
        return ExitCode::SUCCESS;
    }

    let mut config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gridbase: {err}");
            return ExitCode::from(2);
        }
    };
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Err(err) = init_logging_from_config(&config) {
        eprintln!("gridbase: {err}");
        return ExitCode::from(2);
    }

    match command {
        Command::Ping => ExitCode::SUCCESS,
        Command::Migrate => match open_db(&config.db_path) {
            Ok(_) => {
                println!("gridbase migrated {}", config.db_path.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("gridbase: {err}");
                ExitCode::FAILURE
            }
        },
        Command::Scheduler { once } => run_scheduler(&config, once),
    }
}

fn run_scheduler(config: &CoreConfig, once: bool) -> ExitCode {
    let conn = match open_db(&config.db_path) {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("gridbase: {err}");
            return ExitCode::FAILURE;
        }
    };
    let scheduler = NotificationScheduler::new(&conn, OutboxDispatcher)
        .with_lease_ttl(config.scheduler_lease());
    info!(
        "event=cli_scheduler module=cli status=start holder={} once={}",
        scheduler.holder(),
        once
    );

    if once {
        return match scheduler.tick_now() {
            Ok(report) => {
                println!(
                    "scanned={} sent={} skipped={} failed={}",
                    report.scanned, report.sent, report.skipped, report.failed
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("event=cli_scheduler module=cli status=error error={err}");
                eprintln!("gridbase: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let stop = AtomicBool::new(false);
    match scheduler.run(config.scheduler_interval(), &stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gridbase: {err}");
            ExitCode::FAILURE
        }
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Settings come from `GRIDBASE_*` variables; flags override them.
#[derive(Parser, Debug)]
#[command(name = "gridbase", version, about = "gridbase engine maintenance CLI")]
pub struct Cli {
    /// Database file, overriding GRIDBASE_DB_PATH
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print the engine version
    Ping,
    /// Open the database and apply pending migrations
    Migrate,
    /// Deliver due notifications
    Scheduler {
        /// Run a single tick and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Ping)
    }
}

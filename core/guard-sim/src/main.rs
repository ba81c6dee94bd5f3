//! guard-sim: replays page-lifecycle and authentication timelines against a
//! session coordinator on a virtual clock.
//!
//! ## Subcommands
//!
//! - `replay`: run a JSON script, print one JSON line per step
//! - `config`: print the effective configuration as TOML

mod logging;
mod replay;
mod script;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "guard-sim")]
#[command(about = "Session guard timeline simulator")]
#[command(version)]
struct Cli {
    /// Write logs to this directory instead of stderr
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scripted timeline (JSON)
    Replay {
        /// Path to the script file
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// TOML configuration overriding the defaults
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Persist the page-load marker in this file between runs
        #[arg(long, value_name = "PATH")]
        session_file: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// TOML configuration overriding the defaults
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    match cli.command {
        Commands::Replay {
            script,
            config,
            session_file,
        } => {
            if let Err(e) = replay::run(&script, config, session_file) {
                tracing::error!(error = %e, "guard-sim replay failed");
                eprintln!("guard-sim: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Config { config } => match session_guard::load_config(config) {
            Ok(config) => match toml::to_string_pretty(&config) {
                Ok(rendered) => print!("{}", rendered),
                Err(e) => {
                    eprintln!("guard-sim: failed to render config: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("guard-sim: {}", e);
                std::process::exit(1);
            }
        },
    }
}

//! wise-magpie: a local background agent for otherwise-wasted quota.
//!
//! The daemon watches for the operator to step away, then spends idle
//! Claude Max quota on queued maintenance work, one task at a time, each on
//! its own git branch for later review.
//!
//! # Architecture
//!
//! - **Store** (`core::store`): one SQLite database holds tasks, presence
//!   samples, the rolling quota window, spend records, and daemon metadata.
//!   All access is serialized; the scheduler polls it and nothing calls
//!   back.
//! - **Decision engine** (`plugins::daemon`): every tick walks six
//!   admission gates (presence, idle duration, predicted return, budget,
//!   pending work, exclusivity) before dispatching.
//! - **Prediction** (`plugins::schedule`): a Laplace-smoothed weekly
//!   heatmap learned from presence samples answers "when is the operator
//!   back" and "how long is the idle stretch ahead".
//! - **Quota & budget** (`plugins::quota`, `plugins::budget`): per-model
//!   message counts within the rolling window (with a safety margin
//!   reserved for interactive use) and USD caps per task and per day.
//! - **Execution** (`plugins::executor`): the assistant CLI runs as a
//!   subprocess on a dedicated `assistant/<slug>-<id>` branch; the prior
//!   checkout is restored on every exit path and branches are only ever
//!   merged or deleted by the review workflow.
//!
//! # Crate structure
//!
//! - [`core`]: fundamental types and the control plane (store, config,
//!   external-action broker)
//! - [`plugins`]: subsystem implementations (activity, schedule, quota,
//!   budget, tasks, executor, daemon, review)

pub mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{Cli, Command, ConfigCli, ConfigCommand};
use crate::core::config;
use crate::core::error::MagpieError;
use crate::core::store::Store;
use clap::Parser;

pub fn run() -> Result<(), MagpieError> {
    let cli = Cli::parse();
    let config_root = config::config_dir()?;

    match cli.command {
        // Config commands must work before anything else exists.
        Command::Config(config_cli) => run_config_cli(&config_root, config_cli),
        command => {
            let cfg = config::load(&config_root)?;
            let store = Store::open(&config_root);
            store.initialize()?;
            match command {
                Command::Config(_) => unreachable!(),
                Command::Quota(quota_cli) => {
                    plugins::quota::run_quota_cli(&store, &cfg, quota_cli)
                }
                Command::Schedule(schedule_cli) => {
                    plugins::schedule::run_schedule_cli(&store, &cfg, schedule_cli)
                }
                Command::Tasks(tasks_cli) => {
                    plugins::tasks::run_tasks_cli(&config_root, &cfg, &store, tasks_cli)
                }
                Command::Review(review_cli) => {
                    plugins::review::run_review_cli(&config_root, &store, review_cli)
                }
                Command::Start { foreground } => {
                    plugins::daemon::start(&config_root, &cfg, foreground)
                }
                Command::Stop => plugins::daemon::stop(&config_root),
                Command::Status => plugins::daemon::status(&config_root, &cfg, &store),
            }
        }
    }
}

fn run_config_cli(config_root: &std::path::Path, cli: ConfigCli) -> Result<(), MagpieError> {
    match cli.command {
        ConfigCommand::Init { force } => {
            let path = config::init(config_root, force)?;
            println!("Config created: {}", path.display());
            Ok(())
        }
        ConfigCommand::Show => {
            let path = config::config_file(config_root);
            if !path.exists() {
                return Err(MagpieError::NotFound(format!(
                    "no config file at {}; run `wise-magpie config init`",
                    path.display()
                )));
            }
            print!("{}", std::fs::read_to_string(&path)?);
            Ok(())
        }
        ConfigCommand::Edit => {
            let path = config::config_file(config_root);
            if !path.exists() {
                return Err(MagpieError::NotFound(format!(
                    "no config file at {}; run `wise-magpie config init`",
                    path.display()
                )));
            }
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let status = std::process::Command::new(&editor).arg(&path).status()?;
            if !status.success() {
                return Err(MagpieError::Precondition(format!(
                    "{} exited with {}",
                    editor, status
                )));
            }
            Ok(())
        }
    }
}

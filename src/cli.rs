//! CLI struct definitions for the wise-magpie command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "wise-magpie",
    version = env!("CARGO_PKG_VERSION"),
    about = "Turn idle Claude Max quota into reviewed work: a local daemon that predicts \
             when you are away, picks queued tasks, and runs them on isolated branches."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage configuration
    Config(ConfigCli),
    /// Quota tracking, corrections, and history
    Quota(QuotaCli),
    /// Learned activity patterns and idle predictions
    Schedule(ScheduleCli),
    /// Task queue management
    Tasks(TasksCli),
    /// Review completed autonomous work
    Review(ReviewCli),
    /// Start the daemon
    Start {
        /// Run in the foreground instead of detaching
        #[clap(long)]
        foreground: bool,
    },
    /// Stop the daemon (finishes the current task first)
    Stop,
    /// Show daemon, quota, budget, and task status
    Status,
}

#[derive(clap::Args, Debug)]
pub struct ConfigCli {
    #[clap(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Create the default configuration file
    Init {
        /// Overwrite an existing config
        #[clap(long)]
        force: bool,
    },
    /// Print the current configuration
    Show,
    /// Open the configuration in $EDITOR
    Edit,
}

#[derive(clap::Args, Debug)]
pub struct QuotaCli {
    #[clap(subcommand)]
    pub command: QuotaCommand,
}

#[derive(Subcommand, Debug)]
pub enum QuotaCommand {
    /// Show per-model window usage and remaining quota
    Show,
    /// Apply an operator correction for one model's remaining messages
    Correct {
        /// Model tier (opus, sonnet, haiku, or full id)
        #[clap(long)]
        model: String,
        /// Messages remaining for autonomous use in the current window
        #[clap(long)]
        remaining: i64,
    },
    /// Fetch utilization from the usage API and apply it as corrections
    Sync,
    /// Show usage history and recent corrections
    History {
        /// Number of days to show
        #[clap(long, default_value_t = 7)]
        days: i64,
    },
}

#[derive(clap::Args, Debug)]
pub struct ScheduleCli {
    #[clap(subcommand)]
    pub command: ScheduleCommand,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Show the learned weekly activity heatmap
    Show,
    /// Predict idle windows and estimated quota waste
    Predict {
        /// Hours to look ahead
        #[clap(long, default_value_t = 24)]
        hours: i64,
    },
}

#[derive(clap::Args, Debug)]
pub struct TasksCli {
    #[clap(subcommand)]
    pub command: TasksCommand,
}

#[derive(Subcommand, Debug)]
pub enum TasksCommand {
    /// List tasks in the queue
    List {
        /// Filter by status (pending, running, completed, failed,
        /// awaiting_review, rejected, all)
        #[clap(long)]
        status: Option<String>,
    },
    /// Add a task to the queue
    Add {
        /// Task title
        #[clap(value_name = "TITLE")]
        title: String,
        #[clap(short, long, default_value = "")]
        description: String,
        /// Priority 0-100; scored automatically when omitted
        #[clap(short, long)]
        priority: Option<f64>,
        /// Model to use (opus, sonnet, haiku, or auto)
        #[clap(short, long, default_value = "auto")]
        model: String,
        /// Working directory for the task (defaults to the current dir)
        #[clap(long)]
        dir: Option<PathBuf>,
    },
    /// Scan a repository for tasks (comments, queue file, auto templates)
    Scan {
        /// Path to scan (defaults to auto_tasks.work_dir)
        #[clap(long)]
        path: Option<PathBuf>,
    },
    /// Remove a task from the queue
    Remove {
        #[clap(value_name = "TASK_ID")]
        task_id: i64,
    },
}

#[derive(clap::Args, Debug)]
pub struct ReviewCli {
    #[clap(subcommand)]
    pub command: ReviewCommand,
}

#[derive(Subcommand, Debug)]
pub enum ReviewCommand {
    /// List tasks awaiting review
    List,
    /// Show details, commits, and diff for a task
    Show {
        #[clap(value_name = "TASK_ID")]
        task_id: i64,
    },
    /// Merge a task's work branch and mark it done
    Approve {
        #[clap(value_name = "TASK_ID")]
        task_id: i64,
    },
    /// Discard a task's work branch
    Reject {
        #[clap(value_name = "TASK_ID")]
        task_id: i64,
    },
    /// Record feedback as a follow-up task
    Respond {
        #[clap(value_name = "TASK_ID")]
        task_id: i64,
        /// Feedback text for the follow-up task
        #[clap(value_name = "FEEDBACK")]
        feedback: String,
    },
}

//! Task queue management (operator-facing CLI).

use crate::cli::{TasksCli, TasksCommand};
use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::models::{NewTask, RequestedModel, TaskSource, TaskStatus};
use crate::core::store::Store;
use crate::plugins::priority;
use crate::plugins::task_sources::{default_scanners, scan_all, ScanContext};
use chrono::{Local, Utc};
use colored::Colorize;
use std::path::PathBuf;

pub fn run_tasks_cli(
    config_root: &std::path::Path,
    cfg: &Config,
    store: &Store,
    cli: TasksCli,
) -> Result<(), MagpieError> {
    match cli.command {
        TasksCommand::List { status } => list_tasks(store, status.as_deref()),
        TasksCommand::Add {
            title,
            description,
            priority,
            model,
            dir,
        } => add_task(store, title, description, priority, model, dir),
        TasksCommand::Scan { path } => scan_tasks(config_root, cfg, store, path),
        TasksCommand::Remove { task_id } => remove_task(store, task_id),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", cut)
}

fn status_label(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().normal(),
        TaskStatus::Running => status.as_str().bright_cyan(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
        TaskStatus::AwaitingReview => status.as_str().yellow(),
        TaskStatus::Rejected => status.as_str().dimmed(),
    }
}

fn list_tasks(store: &Store, status_filter: Option<&str>) -> Result<(), MagpieError> {
    let filter = match status_filter {
        None | Some("all") => None,
        Some(s) => Some(TaskStatus::parse(s).map_err(|_| {
            MagpieError::NotFound(format!("unknown status filter: {}", s))
        })?),
    };
    let tasks = store.list_tasks(filter)?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:>4}  {:<15}  {:>5}  {:<13}  Title",
        "ID", "Status", "Pri", "Source"
    );
    println!("{}", "-".repeat(72));
    for t in &tasks {
        println!(
            "{:>4}  {:<15}  {:>5.1}  {:<13}  {}",
            t.id,
            status_label(t.status),
            t.priority,
            t.source.as_str(),
            truncate(&t.title, 50)
        );
    }
    println!();
    println!("{} task(s) total.", tasks.len());
    Ok(())
}

fn add_task(
    store: &Store,
    title: String,
    description: String,
    priority: Option<f64>,
    model: String,
    dir: Option<PathBuf>,
) -> Result<(), MagpieError> {
    let requested_model = RequestedModel::parse(&model)?;
    let work_dir = match dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    let priority = match priority {
        Some(p) => p.clamp(0.0, 100.0),
        None => priority::score(TaskSource::Manual, &title, &description),
    };
    let task = store.create_task(
        &NewTask {
            title,
            description,
            source: TaskSource::Manual,
            source_ref: None,
            requested_model,
            priority,
            work_dir: work_dir.to_string_lossy().to_string(),
        },
        Utc::now(),
    )?;
    println!(
        "Added task #{}: {} (priority {:.1})",
        task.id, task.title, task.priority
    );
    Ok(())
}

fn scan_tasks(
    config_root: &std::path::Path,
    cfg: &Config,
    store: &Store,
    path: Option<PathBuf>,
) -> Result<(), MagpieError> {
    let work_dir = match path {
        Some(p) => p,
        None => cfg.auto_tasks.resolved_work_dir(),
    };
    let work_dir = work_dir.canonicalize().map_err(|e| {
        MagpieError::Precondition(format!("cannot scan {}: {}", work_dir.display(), e))
    })?;

    let ctx = ScanContext {
        config_root,
        cfg,
        store,
        work_dir: &work_dir,
        now: Utc::now(),
        today: Local::now().date_naive(),
    };
    let scanners = default_scanners();
    let outcome = scan_all(&ctx, &scanners)?;

    println!(
        "Scanned {}: {} candidate(s), {} new.",
        work_dir.display(),
        outcome.found,
        outcome.inserted.len()
    );
    for task in &outcome.inserted {
        println!(
            "  {} #{} [{}] {} (priority {:.1})",
            "+".green(),
            task.id,
            task.source.as_str(),
            truncate(&task.title, 60),
            task.priority
        );
    }
    Ok(())
}

fn remove_task(store: &Store, task_id: i64) -> Result<(), MagpieError> {
    let task = store.delete_task(task_id)?;
    println!("Removed task #{}: {}", task_id, task.title);
    Ok(())
}

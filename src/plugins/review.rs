//! Review workflow for completed autonomous work.
//!
//! The executor leaves every successful task on its own branch in
//! `awaiting_review`; these commands are how the operator disposes of it.
//! Approve merges and deletes the branch; reject deletes it. Tasks are not
//! resumable, so `respond` turns operator feedback into a fresh task
//! instead of re-entering the old one.

use crate::cli::{ReviewCli, ReviewCommand};
use crate::core::error::MagpieError;
use crate::core::models::{NewTask, RequestedModel, Task, TaskSource, TaskStatus};
use crate::core::store::Store;
use crate::core::vcs;
use crate::plugins::priority;
use chrono::Utc;
use colored::Colorize;
use std::path::Path;

pub fn run_review_cli(
    config_root: &Path,
    store: &Store,
    cli: ReviewCli,
) -> Result<(), MagpieError> {
    match cli.command {
        ReviewCommand::List => list_reviews(store),
        ReviewCommand::Show { task_id } => show_review(config_root, store, task_id),
        ReviewCommand::Approve { task_id } => approve_task(config_root, store, task_id),
        ReviewCommand::Reject { task_id } => reject_task(config_root, store, task_id),
        ReviewCommand::Respond { task_id, feedback } => respond_task(store, task_id, feedback),
    }
}

fn get_reviewable(store: &Store, task_id: i64) -> Result<Task, MagpieError> {
    let task = store
        .get_task(task_id)?
        .ok_or_else(|| MagpieError::NotFound(format!("task #{}", task_id)))?;
    if task.status != TaskStatus::AwaitingReview {
        return Err(MagpieError::Precondition(format!(
            "task #{} is not awaiting review (status: {})",
            task_id,
            task.status.as_str()
        )));
    }
    Ok(task)
}

fn list_reviews(store: &Store) -> Result<(), MagpieError> {
    let tasks = store.list_tasks(Some(TaskStatus::AwaitingReview))?;
    if tasks.is_empty() {
        println!("No completed tasks awaiting review.");
        return Ok(());
    }
    println!("{:>4}  {:<40}  Title", "ID", "Branch");
    println!("{}", "-".repeat(80));
    for t in &tasks {
        let branch = t.branch_name.as_deref().unwrap_or("(no branch)");
        println!("{:>4}  {:<40}  {}", t.id, branch, t.title);
    }
    Ok(())
}

fn show_review(config_root: &Path, store: &Store, task_id: i64) -> Result<(), MagpieError> {
    let task = store
        .get_task(task_id)?
        .ok_or_else(|| MagpieError::NotFound(format!("task #{}", task_id)))?;

    println!("{}", format!("Task #{}: {}", task.id, task.title).bold());
    println!("Status:  {}", task.status.as_str());
    println!(
        "Source:  {} ({})",
        task.source.as_str(),
        task.source_ref.as_deref().unwrap_or("-")
    );
    println!("Model:   {}", if task.model.is_empty() { "-" } else { &task.model });
    println!("Branch:  {}", task.branch_name.as_deref().unwrap_or("-"));
    println!("Cost:    ${:.4}", task.actual_cost_usd);
    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(at) = task.started_at {
        println!("Started: {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(at) = task.finished_at {
        println!("Done:    {}", at.format("%Y-%m-%d %H:%M:%S"));
    }

    if !task.result_summary.is_empty() {
        println!();
        println!("--- Result Summary ---");
        println!("{}", task.result_summary);
    }

    let (Some(branch), false) = (task.branch_name.as_deref(), task.work_dir.is_empty()) else {
        return Ok(());
    };
    let work_dir = Path::new(&task.work_dir);
    let base = vcs::default_base_branch(config_root, work_dir)?
        .unwrap_or_else(|| "HEAD".to_string());

    println!();
    println!("--- Commits ---");
    match vcs::branch_log(config_root, work_dir, branch, &base) {
        Ok(log) if !log.is_empty() => println!("{}", log),
        Ok(_) => println!("(no commits)"),
        Err(e) => println!("(could not get log: {})", e),
    }

    println!();
    println!("--- Diff ---");
    match vcs::branch_diff(config_root, work_dir, branch, &base) {
        Ok(diff) if !diff.trim().is_empty() => println!("{}", diff),
        Ok(_) => println!("(no changes)"),
        Err(e) => println!("(could not get diff: {})", e),
    }
    Ok(())
}

fn approve_task(config_root: &Path, store: &Store, task_id: i64) -> Result<(), MagpieError> {
    let task = get_reviewable(store, task_id)?;
    let Some(branch) = task.branch_name.clone() else {
        return Err(MagpieError::Precondition(format!(
            "task #{} has no work branch to merge",
            task_id
        )));
    };
    if task.work_dir.is_empty() {
        return Err(MagpieError::Precondition(format!(
            "task #{} has no work directory recorded",
            task_id
        )));
    }
    let work_dir = Path::new(&task.work_dir);

    let target = vcs::current_branch(config_root, work_dir)?;
    println!("Merging {} into {}...", branch, target);
    vcs::merge_no_ff(config_root, work_dir, &branch, &target)?;

    // Branch ref is gone after a successful merge; the row keeps its name
    // as history.
    if let Err(e) = vcs::delete_branch(config_root, work_dir, &branch) {
        println!("Warning: could not delete merged branch: {}", e);
    }
    store.update_task_status(task_id, TaskStatus::Completed, Utc::now())?;
    println!("{}", format!("Task #{} approved and merged.", task_id).green());
    Ok(())
}

fn reject_task(config_root: &Path, store: &Store, task_id: i64) -> Result<(), MagpieError> {
    let task = get_reviewable(store, task_id)?;
    if let (Some(branch), false) = (task.branch_name.as_deref(), task.work_dir.is_empty()) {
        println!("Deleting branch {}...", branch);
        match vcs::delete_branch(config_root, Path::new(&task.work_dir), branch) {
            Ok(()) => println!("Branch deleted."),
            Err(e) => println!("Warning: could not delete branch: {}", e),
        }
    }
    store.update_task_status(task_id, TaskStatus::Rejected, Utc::now())?;
    store.set_task_branch(task_id, None)?;
    println!("Task #{} rejected.", task_id);
    Ok(())
}

/// Record operator feedback as a follow-up task. The original stays
/// awaiting review; autonomous work is not resumable.
fn respond_task(store: &Store, task_id: i64, feedback: String) -> Result<(), MagpieError> {
    let task = get_reviewable(store, task_id)?;
    let title = format!("Follow-up: {}", task.title);
    let description = match task.branch_name.as_deref() {
        Some(branch) => format!(
            "Operator feedback on task #{} (branch {}): {}",
            task.id, branch, feedback
        ),
        None => format!("Operator feedback on task #{}: {}", task.id, feedback),
    };
    let priority = priority::score(TaskSource::Manual, &title, &description);
    let follow_up = store.create_task(
        &NewTask {
            title,
            description,
            source: TaskSource::Manual,
            source_ref: None,
            requested_model: RequestedModel::Auto,
            priority,
            work_dir: task.work_dir.clone(),
        },
        Utc::now(),
    )?;
    println!(
        "Recorded feedback as task #{} (original #{} stays awaiting review).",
        follow_up.id, task.id
    );
    Ok(())
}

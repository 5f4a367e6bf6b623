//! Task execution: branch isolation plus the assistant CLI subprocess.
//!
//! Each run acquires a dedicated work branch, invokes the assistant with a
//! prompt built from the task, and restores the prior checkout on every
//! exit path. The executor never merges or deletes branches; that belongs
//! to the review workflow. Results come back as an explicit outcome variant
//! the scheduler switches on.

use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::external::{self, ExternalCapability, ASSISTANT_BIN};
use crate::core::models::{ModelTier, Task};
use crate::core::vcs;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::time::Duration;

/// Hard wall-clock cap for one assistant invocation.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_SUMMARY_CHARS: usize = 2000;
const MAX_STDERR_TAIL_BYTES: usize = 4096;
const MAX_SLUG_CHARS: usize = 50;
const BRANCH_PREFIX: &str = "assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotARepo,
    DirtyTree,
    BranchSetup,
    Timeout,
    NonZeroExit,
    UnparseableOutput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotARepo => "not_a_repo",
            FailureKind::DirtyTree => "dirty_working_tree",
            FailureKind::BranchSetup => "branch_setup",
            FailureKind::Timeout => "timeout",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::UnparseableOutput => "unparseable_output",
        }
    }
}

/// What one execution attempt produced. `branch_name` is present whenever
/// the work branch was created, success or not, so the scheduler can
/// persist it.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Ok {
        summary: String,
        cost_usd: f64,
        input_tokens: i64,
        output_tokens: i64,
        duration_secs: f64,
        branch_name: String,
    },
    Failed {
        kind: FailureKind,
        detail: String,
        branch_name: Option<String>,
    },
}

/// Seam between the scheduler and the real subprocess work; tests stub it.
pub trait TaskRunner {
    fn run(
        &self,
        task: &Task,
        tier: ModelTier,
        max_budget_usd: f64,
    ) -> Result<ExecOutcome, MagpieError>;
}

/// Lowercase with every non-alphanumeric run collapsed to a single `-`, so
/// titles carrying paths or punctuation cannot smuggle separators into the
/// branch ref.
pub fn slugify(name: &str) -> String {
    let mut slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').chars().take(MAX_SLUG_CHARS).collect()
}

pub fn branch_name_for(task: &Task) -> String {
    format!("{}/{}-{}", BRANCH_PREFIX, slugify(&task.title), task.id)
}

fn build_prompt(task: &Task) -> String {
    format!(
        "Task: {}\nDescription: {}\n\nPlease complete this task. Make all necessary code \
         changes and commit your work with a descriptive message.",
        task.title, task.description
    )
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(MAX_STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).to_string()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[derive(Debug, PartialEq)]
struct ParsedOutput {
    summary: String,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: Option<f64>,
}

/// The assistant emits one JSON object with the result text and, when
/// available, token usage and cost.
fn parse_cli_output(stdout: &str) -> Option<ParsedOutput> {
    let data: JsonValue = serde_json::from_str(stdout.trim()).ok()?;
    let summary = data
        .get("result")
        .and_then(|r| r.as_str())
        .unwrap_or(stdout.trim())
        .to_string();
    let usage = data.get("usage");
    let token = |key: &str| -> i64 {
        usage
            .and_then(|u| u.get(key))
            .or_else(|| data.get(key))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    };
    let cost_usd = data
        .get("total_cost_usd")
        .or_else(|| data.get("cost_usd"))
        .and_then(|v| v.as_f64());
    Some(ParsedOutput {
        summary,
        input_tokens: token("input_tokens"),
        output_tokens: token("output_tokens"),
        cost_usd,
    })
}

/// Scoped branch checkout: created against the original branch, restored on
/// every exit path (explicitly where possible, best-effort on drop).
struct WorkBranch<'a> {
    config_root: &'a Path,
    work_dir: &'a Path,
    original: String,
    pub name: String,
    restored: bool,
}

impl<'a> WorkBranch<'a> {
    fn acquire(
        config_root: &'a Path,
        work_dir: &'a Path,
        task: &Task,
    ) -> Result<Result<WorkBranch<'a>, String>, MagpieError> {
        let original = vcs::current_branch(config_root, work_dir)?;
        let mut name = branch_name_for(task);
        if vcs::branch_exists(config_root, work_dir, &name)? {
            // Leftover from an earlier attempt; suffix keeps it unique.
            name = format!("{}-retry{}", name, task.retry_count + 1);
        }
        match vcs::create_branch(config_root, work_dir, &name) {
            Ok(()) => Ok(Ok(WorkBranch {
                config_root,
                work_dir,
                original,
                name,
                restored: false,
            })),
            Err(e) => Ok(Err(e.to_string())),
        }
    }

    fn restore(&mut self) -> Result<(), MagpieError> {
        if self.restored {
            return Ok(());
        }
        vcs::checkout(self.config_root, self.work_dir, &self.original)?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for WorkBranch<'_> {
    fn drop(&mut self) {
        if !self.restored {
            let _ = vcs::checkout(self.config_root, self.work_dir, &self.original);
        }
    }
}

/// The real executor: wraps the assistant CLI.
pub struct AssistantExecutor<'a> {
    config_root: &'a Path,
    cfg: &'a Config,
}

impl<'a> AssistantExecutor<'a> {
    pub fn new(config_root: &'a Path, cfg: &'a Config) -> AssistantExecutor<'a> {
        AssistantExecutor { config_root, cfg }
    }
}

impl TaskRunner for AssistantExecutor<'_> {
    fn run(
        &self,
        task: &Task,
        tier: ModelTier,
        max_budget_usd: f64,
    ) -> Result<ExecOutcome, MagpieError> {
        let work_dir = Path::new(&task.work_dir);

        if !vcs::is_repo(work_dir) {
            return Ok(ExecOutcome::Failed {
                kind: FailureKind::NotARepo,
                detail: format!("not a git repository: {}", work_dir.display()),
                branch_name: None,
            });
        }
        if vcs::is_dirty(self.config_root, work_dir)? {
            return Ok(ExecOutcome::Failed {
                kind: FailureKind::DirtyTree,
                detail: format!(
                    "repository has uncommitted changes: {}; commit or stash before \
                     autonomous tasks run",
                    work_dir.display()
                ),
                branch_name: None,
            });
        }

        let mut branch = match WorkBranch::acquire(self.config_root, work_dir, task)? {
            Ok(b) => b,
            Err(detail) => {
                return Ok(ExecOutcome::Failed {
                    kind: FailureKind::BranchSetup,
                    detail,
                    branch_name: None,
                });
            }
        };

        let prompt = build_prompt(task);
        let budget_flag = format!("--max-budget-usd={}", max_budget_usd);
        let mut args: Vec<&str> = vec![
            "-p",
            &prompt,
            "--output-format",
            "json",
            "--model",
            tier.model_id(),
            "--max-turns",
            "50",
            &budget_flag,
        ];
        for flag in &self.cfg.assistant.extra_flags {
            args.push(flag);
        }

        let run = external::execute_with_timeout(
            self.config_root,
            ExternalCapability::AssistantExec,
            "executor.run",
            ASSISTANT_BIN,
            &args,
            work_dir,
            EXECUTION_TIMEOUT,
        );
        let timed = match run {
            Ok(t) => t,
            Err(e) => {
                // Work branch stays for inspection; checkout goes back.
                branch.restore()?;
                return Err(e);
            }
        };
        branch.restore()?;

        let branch_name = branch.name.clone();
        if timed.timed_out {
            return Ok(ExecOutcome::Failed {
                kind: FailureKind::Timeout,
                detail: format!(
                    "assistant did not finish within {}s",
                    EXECUTION_TIMEOUT.as_secs()
                ),
                branch_name: Some(branch_name),
            });
        }
        if !timed.output.status.success() {
            return Ok(ExecOutcome::Failed {
                kind: FailureKind::NonZeroExit,
                detail: stderr_tail(&timed.output.stderr),
                branch_name: Some(branch_name),
            });
        }

        let stdout = String::from_utf8_lossy(&timed.output.stdout);
        let Some(parsed) = parse_cli_output(&stdout) else {
            return Ok(ExecOutcome::Failed {
                kind: FailureKind::UnparseableOutput,
                detail: truncate_chars(stdout.trim(), MAX_SUMMARY_CHARS),
                branch_name: Some(branch_name),
            });
        };

        // Fall back to tier averages when the CLI reports no cost.
        let cost_usd = match parsed.cost_usd {
            Some(c) => c,
            None if parsed.input_tokens > 0 || parsed.output_tokens > 0 => {
                tier.cost_for(parsed.input_tokens, parsed.output_tokens)
            }
            None => tier.avg_message_cost(),
        };

        Ok(ExecOutcome::Ok {
            summary: truncate_chars(&parsed.summary, MAX_SUMMARY_CHARS),
            cost_usd,
            input_tokens: parsed.input_tokens,
            output_tokens: parsed.output_tokens,
            duration_secs: timed.duration.as_secs_f64(),
            branch_name,
        })
    }
}

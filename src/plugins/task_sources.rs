//! Task intake: pluggable scanners that turn repository state into
//! candidate tasks.
//!
//! Three sources are registered at startup: TODO-style code comments in
//! tracked files, the queue file at the repo root, and the built-in
//! auto-template table. Every candidate is keyed by `(source, source_ref)`;
//! the aggregator skips keys the store already knows, so a scan is
//! idempotent within a calendar day.

use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::models::{NewTask, RequestedModel, Task, TaskSource};
use crate::core::store::Store;
use crate::core::vcs;
use crate::plugins::model_policy::Difficulty;
use crate::plugins::priority;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const MAX_COMMENT_TITLE_CHARS: usize = 120;

pub struct ScanContext<'a> {
    pub config_root: &'a Path,
    pub cfg: &'a Config,
    pub store: &'a Store,
    pub work_dir: &'a Path,
    pub now: DateTime<Utc>,
    /// Local calendar date; auto-template refs are day-scoped.
    pub today: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub title: String,
    pub description: String,
    pub source: TaskSource,
    pub source_ref: Option<String>,
}

impl Candidate {
    fn into_new_task(self, work_dir: &Path) -> NewTask {
        let priority = priority::score(self.source, &self.title, &self.description);
        NewTask {
            title: self.title,
            description: self.description,
            source: self.source,
            source_ref: self.source_ref,
            requested_model: RequestedModel::Auto,
            priority,
            work_dir: work_dir.to_string_lossy().to_string(),
        }
    }
}

pub trait TaskScanner {
    fn name(&self) -> &'static str;
    fn scan(&self, ctx: &ScanContext) -> Result<Vec<Candidate>, MagpieError>;
}

/// The scanners wired in at startup; not hot-pluggable.
pub fn default_scanners() -> Vec<Box<dyn TaskScanner>> {
    vec![
        Box::new(CodeCommentScanner),
        Box::new(QueueFileScanner),
        Box::new(AutoTemplateScanner),
    ]
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub found: usize,
    pub inserted: Vec<Task>,
}

/// Run every scanner, dedup against the store, insert what is new.
pub fn scan_all(
    ctx: &ScanContext,
    scanners: &[Box<dyn TaskScanner>],
) -> Result<ScanOutcome, MagpieError> {
    let mut outcome = ScanOutcome::default();
    for scanner in scanners {
        let candidates = scanner.scan(ctx)?;
        outcome.found += candidates.len();
        for candidate in candidates {
            if let Some(source_ref) = &candidate.source_ref {
                if ctx.store.task_exists(candidate.source, source_ref)? {
                    continue;
                }
            }
            let new = candidate.into_new_task(ctx.work_dir);
            // The unique index backstops a race with a concurrent scan.
            if let Some(task) = ctx.store.create_task_if_new(&new, ctx.now)? {
                outcome.inserted.push(task);
            }
        }
    }
    Ok(outcome)
}

// --- Code comments (TODO / FIXME / HACK / XXX) ---

pub struct CodeCommentScanner;

fn todo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // comment leader, keyword, optional separator, body
        Regex::new(r"(?i)(?:#|//|/\*|\*|--|;)\s*(TODO|FIXME|HACK|XXX)[\s:(\-]*(.+?)$").unwrap()
    })
}

const TEST_DIRS: &[&str] = &["tests", "test", "spec", "__tests__"];

const TEST_FILE_PATTERNS: &[&str] = &[
    "test_*.py",
    "*_test.py",
    "*_spec.py",
    "conftest.py",
    "*.test.js",
    "*.test.ts",
    "*.spec.js",
    "*.spec.ts",
];

fn glob_match(pattern: &str, name: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix('*') {
        return name.ends_with(rest);
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return name.starts_with(prefix) && name.ends_with(suffix);
    }
    pattern == name
}

/// TODO comments in test files are not actionable work items.
fn is_test_file(rel_path: &str) -> bool {
    let path = Path::new(rel_path);
    let components: Vec<&str> = path
        .iter()
        .filter_map(|c| c.to_str())
        .collect();
    if components.len() > 1
        && components[..components.len() - 1]
            .iter()
            .any(|c| TEST_DIRS.contains(c))
    {
        return true;
    }
    let name = components.last().copied().unwrap_or("");
    TEST_FILE_PATTERNS.iter().any(|p| glob_match(p, name))
}

fn parse_comment_line(line: &str) -> Option<(String, String)> {
    let caps = todo_re().captures(line)?;
    let keyword = caps.get(1)?.as_str().to_uppercase();
    let body = caps
        .get(2)?
        .as_str()
        .trim()
        .trim_end_matches("*/")
        .trim()
        .to_string();
    if body.is_empty() {
        return None;
    }
    Some((keyword, body))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

impl TaskScanner for CodeCommentScanner {
    fn name(&self) -> &'static str {
        "code_comment"
    }

    fn scan(&self, ctx: &ScanContext) -> Result<Vec<Candidate>, MagpieError> {
        if !vcs::is_repo(ctx.work_dir) {
            return Ok(Vec::new());
        }
        let tracked = vcs::tracked_files(ctx.config_root, ctx.work_dir)?;
        let mut candidates = Vec::new();
        for rel_path in tracked {
            if is_test_file(&rel_path) {
                continue;
            }
            let file_path = ctx.work_dir.join(&rel_path);
            let Ok(content) = std::fs::read_to_string(&file_path) else {
                continue; // binary or unreadable; skip
            };
            for (lineno, line) in content.lines().enumerate() {
                let Some((keyword, body)) = parse_comment_line(line) else {
                    continue;
                };
                let title = truncate_chars(
                    &format!("[{}] {}", keyword, body),
                    MAX_COMMENT_TITLE_CHARS,
                );
                candidates.push(Candidate {
                    title,
                    description: String::new(),
                    source: TaskSource::CodeComment,
                    source_ref: Some(format!("{}:{}", rel_path, lineno + 1)),
                });
            }
        }
        Ok(candidates)
    }
}

// --- Queue file ---

pub struct QueueFileScanner;

const QUEUE_FILENAMES: &[&str] = &[".wise-magpie-tasks", "wise-magpie-tasks.md"];

fn queue_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Unchecked markdown checkbox; `- [x]` lines are done and ignored.
    RE.get_or_init(|| Regex::new(r"^-\s*\[\s*\]\s+(.+)$").unwrap())
}

fn find_queue_file(work_dir: &Path) -> Option<PathBuf> {
    QUEUE_FILENAMES
        .iter()
        .map(|name| work_dir.join(name))
        .find(|p| p.is_file())
}

pub fn parse_queue_line(line: &str) -> Option<String> {
    let caps = queue_line_re().captures(line.trim())?;
    let title = caps.get(1)?.as_str().trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

impl TaskScanner for QueueFileScanner {
    fn name(&self) -> &'static str {
        "queue_file"
    }

    fn scan(&self, ctx: &ScanContext) -> Result<Vec<Candidate>, MagpieError> {
        let Some(queue_file) = find_queue_file(ctx.work_dir) else {
            return Ok(Vec::new());
        };
        let file_name = queue_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Ok(content) = std::fs::read_to_string(&queue_file) else {
            return Ok(Vec::new());
        };
        let mut candidates = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let Some(title) = parse_queue_line(line) else {
                continue;
            };
            candidates.push(Candidate {
                title,
                description: String::new(),
                source: TaskSource::QueueFile,
                source_ref: Some(format!("{}:{}", file_name, lineno + 1)),
            });
        }
        Ok(candidates)
    }
}

// --- Auto templates ---

/// One kind of routine maintenance task. One variant, many instances: the
/// whole catalogue is this static table, with per-type config overrides for
/// `enabled`, `interval_hours`, and `min_commits`.
pub struct AutoTaskTemplate {
    pub task_type: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// 0 means no interval gate.
    pub interval_hours: i64,
    /// 0 means no commit-count gate.
    pub min_commits: i64,
    pub needs_new_commits: bool,
    pub needs_code_changes: bool,
    /// Advisory; surfaced in scan output. Tier selection still goes through
    /// the keyword classifier.
    pub difficulty: Difficulty,
}

pub const BUILTIN_TEMPLATES: &[AutoTaskTemplate] = &[
    AutoTaskTemplate {
        task_type: "run_tests",
        title: "Run test suite",
        description: "Run the full test suite, investigate any failures, and fix broken tests.",
        interval_hours: 24,
        min_commits: 0,
        needs_new_commits: true,
        needs_code_changes: false,
        difficulty: Difficulty::Simple,
    },
    AutoTaskTemplate {
        task_type: "update_docs",
        title: "Update documentation",
        description: "Review recent code changes and update README or other docs to stay in sync.",
        interval_hours: 48,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Simple,
    },
    AutoTaskTemplate {
        task_type: "lint_check",
        title: "Run linter and fix issues",
        description: "Run the project linter, auto-fix where possible, and address remaining warnings.",
        interval_hours: 12,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Simple,
    },
    AutoTaskTemplate {
        task_type: "clean_commits",
        title: "Clean up commit history",
        description: "Review the current branch commits, squash fixups, and improve commit messages.",
        interval_hours: 0,
        min_commits: 10,
        needs_new_commits: false,
        needs_code_changes: false,
        difficulty: Difficulty::Medium,
    },
    AutoTaskTemplate {
        task_type: "dependency_check",
        title: "Check dependency updates",
        description: "Check for outdated dependencies and evaluate available upgrades for security and compatibility.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: false,
        difficulty: Difficulty::Medium,
    },
    AutoTaskTemplate {
        task_type: "security_audit",
        title: "Audit code for security issues",
        description: "Scan the codebase for security vulnerabilities: hardcoded secrets, injection, insecure deserialization, and other OWASP Top 10 risks. Report findings and apply fixes.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Complex,
    },
    AutoTaskTemplate {
        task_type: "test_coverage",
        title: "Generate tests for uncovered code",
        description: "Identify functions and branches with no test coverage, generate unit tests for the most critical uncovered paths, and verify they pass.",
        interval_hours: 48,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Medium,
    },
    AutoTaskTemplate {
        task_type: "dead_code_detection",
        title: "Detect and remove dead code",
        description: "Find unused imports, functions, and unreachable code. Remove dead code and verify the test suite still passes.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Simple,
    },
    AutoTaskTemplate {
        task_type: "changelog_generation",
        title: "Generate changelog from recent commits",
        description: "Review recent commit history and generate or update changelog entries, grouped by category following Keep a Changelog format.",
        interval_hours: 0,
        min_commits: 5,
        needs_new_commits: false,
        needs_code_changes: false,
        difficulty: Difficulty::Simple,
    },
    AutoTaskTemplate {
        task_type: "deprecation_cleanup",
        title: "Clean up deprecated code usage",
        description: "Find usage of deprecated APIs and patterns, migrate to recommended alternatives, and remove deprecation warnings.",
        interval_hours: 336,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Complex,
    },
    AutoTaskTemplate {
        task_type: "type_coverage",
        title: "Add type annotations to untyped code",
        description: "Identify functions missing type annotations, add them, and run the type checker to verify correctness.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Medium,
    },
];

pub fn template_by_type(task_type: &str) -> Option<&'static AutoTaskTemplate> {
    BUILTIN_TEMPLATES.iter().find(|t| t.task_type == task_type)
}

pub struct AutoTemplateScanner;

/// The six-check admission gate for one template.
fn template_eligible(
    template: &AutoTaskTemplate,
    ctx: &ScanContext,
    source_ref: &str,
) -> Result<bool, MagpieError> {
    let overrides = ctx.cfg.auto_tasks.template(template.task_type);

    // (i) template enabled
    if !overrides.enabled.unwrap_or(true) {
        return Ok(false);
    }

    // (ii) interval since last completion
    let interval = overrides.interval_hours.unwrap_or(template.interval_hours);
    if interval > 0 {
        if let Some(last) = ctx.store.template_last_completed(template.task_type)? {
            if ctx.now - last < Duration::hours(interval) {
                return Ok(false);
            }
        }
    }

    // (iii) commit count on the current branch vs its fork point
    let min_commits = overrides.min_commits.unwrap_or(template.min_commits);
    if min_commits > 0 && vcs::commits_ahead_of_base(ctx.config_root, ctx.work_dir)? < min_commits {
        return Ok(false);
    }

    // (iv) / (v) git activity within the interval window
    if interval > 0 {
        let since = ctx.now - Duration::hours(interval);
        if template.needs_new_commits
            && !vcs::has_commits_since(ctx.config_root, ctx.work_dir, since)?
        {
            return Ok(false);
        }
        if template.needs_code_changes
            && !vcs::has_code_changes_since(ctx.config_root, ctx.work_dir, since)?
        {
            return Ok(false);
        }
    }

    // (vi) no task of this type today
    if ctx.store.task_exists(TaskSource::AutoTemplate, source_ref)? {
        return Ok(false);
    }

    Ok(true)
}

impl TaskScanner for AutoTemplateScanner {
    fn name(&self) -> &'static str {
        "auto_template"
    }

    fn scan(&self, ctx: &ScanContext) -> Result<Vec<Candidate>, MagpieError> {
        if !ctx.cfg.auto_tasks.enabled {
            return Ok(Vec::new());
        }
        let mut candidates = Vec::new();
        for template in BUILTIN_TEMPLATES {
            let source_ref = format!("{}:{}", template.task_type, ctx.today);
            if !template_eligible(template, ctx, &source_ref)? {
                continue;
            }
            candidates.push(Candidate {
                title: template.title.to_string(),
                description: template.description.to_string(),
                source: TaskSource::AutoTemplate,
                source_ref: Some(source_ref),
            });
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_regex_accepts_common_leaders() {
        for line in [
            "# TODO: migrate the config loader",
            "// FIXME   broken on empty input",
            "/* HACK - remove after release */",
            "-- XXX this is wrong",
            "; todo lowercase keyword too",
        ] {
            assert!(parse_comment_line(line).is_some(), "line: {}", line);
        }
        let (kw, body) = parse_comment_line("// FIXME   broken on empty input").unwrap();
        assert_eq!(kw, "FIXME");
        assert_eq!(body, "broken on empty input");
        // Block comment close is stripped from the body.
        let (_, body) = parse_comment_line("/* HACK - remove after release */").unwrap();
        assert_eq!(body, "remove after release");
    }

    #[test]
    fn comment_regex_ignores_plain_lines() {
        assert!(parse_comment_line("let todo_list = vec![];").is_none());
        assert!(parse_comment_line("fn main() {}").is_none());
        // Keyword with no body is not a task.
        assert!(parse_comment_line("# TODO").is_none());
    }

    #[test]
    fn test_files_excluded() {
        assert!(is_test_file("tests/test_runner.py"));
        assert!(is_test_file("src/__tests__/app.js"));
        assert!(is_test_file("pkg/conftest.py"));
        assert!(is_test_file("web/app.spec.ts"));
        assert!(!is_test_file("src/main.rs"));
        assert!(!is_test_file("attested/module.py"));
    }

    #[test]
    fn queue_line_parsing() {
        assert_eq!(
            parse_queue_line("- [ ] Fix the login flow"),
            Some("Fix the login flow".to_string())
        );
        assert_eq!(parse_queue_line("-[ ] Tight spacing"), Some("Tight spacing".to_string()));
        assert_eq!(parse_queue_line("- [x] already done"), None);
        assert_eq!(parse_queue_line("- [X] also done"), None);
        assert_eq!(parse_queue_line("* [ ] wrong bullet"), None);
        assert_eq!(parse_queue_line("plain text"), None);
    }

    #[test]
    fn comment_title_truncated() {
        let body = "a".repeat(300);
        let title = truncate_chars(&format!("[TODO] {}", body), MAX_COMMENT_TITLE_CHARS);
        assert_eq!(title.chars().count(), MAX_COMMENT_TITLE_CHARS);
    }

    #[test]
    fn template_table_is_complete_and_unique() {
        assert_eq!(BUILTIN_TEMPLATES.len(), 11);
        let mut types: Vec<&str> = BUILTIN_TEMPLATES.iter().map(|t| t.task_type).collect();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), 11);
        // Every template has at least one trigger condition.
        for t in BUILTIN_TEMPLATES {
            assert!(
                t.interval_hours > 0 || t.min_commits > 0,
                "template {} has no trigger",
                t.task_type
            );
        }
        assert!(template_by_type("security_audit").is_some());
        assert!(template_by_type("nonexistent").is_none());
    }
}

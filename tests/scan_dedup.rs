//! Source scanning against a real scratch repository: candidate discovery,
//! dedup, and same-day idempotency.

use chrono::{Local, Utc};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;
use wise_magpie::core::config::Config;
use wise_magpie::core::models::TaskSource;
use wise_magpie::core::store::Store;
use wise_magpie::plugins::task_sources::{default_scanners, scan_all, ScanContext};

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// A committed repo containing one TODO comment, one HACK comment inside a
/// test dir (excluded), and a queue file with two open items.
fn setup_repo() -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    let dir = tmp.path();
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);

    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(
        dir.join("src/parser.py"),
        "def parse(line):\n    # TODO: speed up the tokenizer\n    return line.split()\n",
    )
    .unwrap();
    std::fs::create_dir_all(dir.join("tests")).unwrap();
    std::fs::write(
        dir.join("tests/test_parser.py"),
        "# HACK temporary fixture, not a real task\n",
    )
    .unwrap();
    std::fs::write(
        dir.join(".wise-magpie-tasks"),
        "- [ ] Fix the login flow\n- [x] already shipped\n- [ ] Tighten error messages\nnot a task line\n",
    )
    .unwrap();

    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
    tmp
}

fn setup_store() -> (TempDir, Store) {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(tmp.path());
    store.initialize().unwrap();
    (tmp, store)
}

fn scan(config_root: &Path, cfg: &Config, store: &Store, work_dir: &Path) -> (usize, usize) {
    let ctx = ScanContext {
        config_root,
        cfg,
        store,
        work_dir,
        now: Utc::now(),
        today: Local::now().date_naive(),
    };
    let scanners = default_scanners();
    let outcome = scan_all(&ctx, &scanners).expect("scan");
    (outcome.found, outcome.inserted.len())
}

#[test]
fn scan_discovers_comments_and_queue_items() {
    let repo = setup_repo();
    let (cfg_dir, store) = setup_store();
    let cfg = Config::default();

    let (found, inserted) = scan(cfg_dir.path(), &cfg, &store, repo.path());
    // One TODO comment (the test-dir HACK is excluded) + two open queue items.
    assert_eq!(found, 3);
    assert_eq!(inserted, 3);

    let tasks = store.list_tasks(None).unwrap();
    let comment = tasks
        .iter()
        .find(|t| t.source == TaskSource::CodeComment)
        .expect("comment task");
    assert_eq!(comment.title, "[TODO] speed up the tokenizer");
    assert_eq!(comment.source_ref.as_deref(), Some("src/parser.py:2"));

    let queue_titles: Vec<&str> = tasks
        .iter()
        .filter(|t| t.source == TaskSource::QueueFile)
        .map(|t| t.title.as_str())
        .collect();
    assert!(queue_titles.contains(&"Fix the login flow"));
    assert!(queue_titles.contains(&"Tighten error messages"));
    // The checked item was ignored.
    assert!(!tasks.iter().any(|t| t.title.contains("already shipped")));
}

#[test]
fn second_scan_inserts_nothing() {
    let repo = setup_repo();
    let (cfg_dir, store) = setup_store();
    let cfg = Config::default();

    let (_, first) = scan(cfg_dir.path(), &cfg, &store, repo.path());
    assert_eq!(first, 3);
    let (found, second) = scan(cfg_dir.path(), &cfg, &store, repo.path());
    assert_eq!(found, 3);
    assert_eq!(second, 0);
    assert_eq!(store.list_tasks(None).unwrap().len(), 3);
}

#[test]
fn auto_templates_gate_and_stay_idempotent_per_day() {
    let repo = setup_repo();
    let (cfg_dir, store) = setup_store();
    let mut cfg = Config::default();
    cfg.auto_tasks.enabled = true;

    let (_, inserted) = scan(cfg_dir.path(), &cfg, &store, repo.path());
    let autos: Vec<_> = store
        .list_tasks(None)
        .unwrap()
        .into_iter()
        .filter(|t| t.source == TaskSource::AutoTemplate)
        .collect();
    // Fresh repo with one commit: interval templates fire (nothing ever
    // completed, the commit satisfies new-commit/code-change needs), while
    // the commit-count templates (clean_commits, changelog_generation) stay
    // below their thresholds on a branch with no fork point ahead.
    let auto_types: Vec<String> = autos
        .iter()
        .filter_map(|t| t.source_ref.as_ref())
        .map(|r| r.split(':').next().unwrap().to_string())
        .collect();
    assert_eq!(autos.len(), 9, "eligible: {:?}", auto_types);
    assert!(!auto_types.iter().any(|t| t == "clean_commits"));
    assert!(!auto_types.iter().any(|t| t == "changelog_generation"));
    assert!(auto_types.iter().any(|t| t == "run_tests"));
    assert!(auto_types.iter().any(|t| t == "security_audit"));
    assert!(inserted >= autos.len());

    // Same calendar date: the day-scoped refs dedup everything.
    let (_, second) = scan(cfg_dir.path(), &cfg, &store, repo.path());
    assert_eq!(second, 0);
}

#[test]
fn disabled_template_is_skipped() {
    let repo = setup_repo();
    let (cfg_dir, store) = setup_store();
    let cfg: Config = toml::from_str(
        r#"
        [auto_tasks]
        enabled = true

        [auto_tasks.run_tests]
        enabled = false
        "#,
    )
    .unwrap();

    scan(cfg_dir.path(), &cfg, &store, repo.path());
    let tasks = store.list_tasks(None).unwrap();
    assert!(!tasks
        .iter()
        .any(|t| t.source_ref.as_deref().is_some_and(|r| r.starts_with("run_tests:"))));
}

#[test]
fn interval_gate_respects_recent_completion() {
    let repo = setup_repo();
    let (cfg_dir, store) = setup_store();
    let mut cfg = Config::default();
    cfg.auto_tasks.enabled = true;

    // run_tests completed two hours ago; its 24h interval has not elapsed.
    store
        .stamp_template_run("run_tests", Utc::now() - chrono::Duration::hours(2))
        .unwrap();
    scan(cfg_dir.path(), &cfg, &store, repo.path());
    let tasks = store.list_tasks(None).unwrap();
    assert!(!tasks
        .iter()
        .any(|t| t.source_ref.as_deref().is_some_and(|r| r.starts_with("run_tests:"))));
    // Other interval templates were unaffected.
    assert!(tasks
        .iter()
        .any(|t| t.source_ref.as_deref().is_some_and(|r| r.starts_with("lint_check:"))));
}

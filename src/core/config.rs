//! TOML configuration.
//!
//! Configuration lives in `config.toml` inside the config directory
//! (default `~/.config/wise-magpie`, overridable through the
//! `WISE_MAGPIE_CONFIG_DIR` environment variable, which also relocates the
//! database, pid file, and log). A missing file means defaults; a malformed
//! file is a hard config error so the daemon refuses to start on typos.

use crate::core::error::MagpieError;
use crate::core::models::ModelTier;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_ENV: &str = "WISE_MAGPIE_CONFIG_DIR";
pub const CONFIG_FILE_NAME: &str = "config.toml";

// Defaults (Claude Max $200 plan, per 5-hour window)
const DEFAULT_WINDOW_HOURS: i64 = 5;
const DEFAULT_SAFETY_MARGIN: f64 = 0.15;
const DEFAULT_OPUS_LIMIT: i64 = 50;
const DEFAULT_SONNET_LIMIT: i64 = 225;
const DEFAULT_HAIKU_LIMIT: i64 = 500;
const DEFAULT_MAX_TASK_USD: f64 = 2.0;
const DEFAULT_MAX_DAILY_USD: f64 = 10.0;
const DEFAULT_IDLE_THRESHOLD_MINUTES: i64 = 30;
const DEFAULT_RETURN_BUFFER_MINUTES: i64 = 15;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_AUTO_SYNC_INTERVAL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub quota: QuotaConfig,
    pub budget: BudgetConfig,
    pub activity: ActivityConfig,
    pub daemon: DaemonConfig,
    pub assistant: AssistantConfig,
    pub auto_tasks: AutoTasksConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            quota: QuotaConfig::default(),
            budget: BudgetConfig::default(),
            activity: ActivityConfig::default(),
            daemon: DaemonConfig::default(),
            assistant: AssistantConfig::default(),
            auto_tasks: AutoTasksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Rolling window length in hours.
    pub window_hours: i64,
    /// Fraction of each limit reserved for interactive use.
    pub safety_margin: f64,
    pub limits: QuotaLimits,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        QuotaConfig {
            window_hours: DEFAULT_WINDOW_HOURS,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            limits: QuotaLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub opus: i64,
    pub sonnet: i64,
    pub haiku: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        QuotaLimits {
            opus: DEFAULT_OPUS_LIMIT,
            sonnet: DEFAULT_SONNET_LIMIT,
            haiku: DEFAULT_HAIKU_LIMIT,
        }
    }
}

impl QuotaLimits {
    pub fn limit(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Opus => self.opus,
            ModelTier::Sonnet => self.sonnet,
            ModelTier::Haiku => self.haiku,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_task_usd: f64,
    pub max_daily_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        BudgetConfig {
            max_task_usd: DEFAULT_MAX_TASK_USD,
            max_daily_usd: DEFAULT_MAX_DAILY_USD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub idle_threshold_minutes: i64,
    pub return_buffer_minutes: i64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        ActivityConfig {
            idle_threshold_minutes: DEFAULT_IDLE_THRESHOLD_MINUTES,
            return_buffer_minutes: DEFAULT_RETURN_BUFFER_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between scheduler ticks.
    pub poll_interval: u64,
    /// Minutes between upstream quota syncs; 0 disables.
    pub auto_sync_interval_minutes: i64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            auto_sync_interval_minutes: DEFAULT_AUTO_SYNC_INTERVAL_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Default model (alias or full id) when auto-selection is off or a task
    /// forces no tier.
    pub model: String,
    pub auto_select_model: bool,
    pub extra_flags: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        AssistantConfig {
            model: "sonnet".to_string(),
            auto_select_model: true,
            extra_flags: Vec::new(),
        }
    }
}

impl AssistantConfig {
    pub fn default_tier(&self) -> Result<ModelTier, MagpieError> {
        ModelTier::parse(&self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AutoTasksConfig {
    pub enabled: bool,
    pub work_dir: Option<PathBuf>,
    /// Per-template overrides keyed by task type, e.g.
    /// `[auto_tasks.lint_check] enabled = false`.
    #[serde(flatten)]
    pub templates: BTreeMap<String, TemplateOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TemplateOverride {
    pub enabled: Option<bool>,
    pub interval_hours: Option<i64>,
    pub min_commits: Option<i64>,
}

impl AutoTasksConfig {
    pub fn template(&self, task_type: &str) -> TemplateOverride {
        self.templates.get(task_type).cloned().unwrap_or_default()
    }

    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

// --- Loading & paths ---

/// Resolve the config directory without creating it.
pub fn config_dir() -> Result<PathBuf, MagpieError> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = env::var("HOME")
        .map_err(|_| MagpieError::Config("HOME environment variable missing".to_string()))?;
    Ok(PathBuf::from(home).join(".config").join("wise-magpie"))
}

pub fn config_file(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

pub fn pid_path(dir: &Path) -> PathBuf {
    dir.join(schemas::PID_FILE_NAME)
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(schemas::LOG_FILE_NAME)
}

/// Load config from `config.toml`, falling back to defaults when absent.
pub fn load(dir: &Path) -> Result<Config, MagpieError> {
    let path = config_file(dir);
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| MagpieError::Config(format!("{}: {}", path.display(), e)))
}

/// Write the default commented template. Refuses to clobber unless `force`.
pub fn init(dir: &Path, force: bool) -> Result<PathBuf, MagpieError> {
    fs::create_dir_all(dir)?;
    let path = config_file(dir);
    if path.exists() && !force {
        return Err(MagpieError::Precondition(format!(
            "config already exists: {} (use --force to overwrite)",
            path.display()
        )));
    }
    fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
    Ok(path)
}

pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# wise-magpie configuration

[quota]
# Rolling quota window duration in hours
window_hours = 5
# Reserve this fraction of each limit for interactive use
safety_margin = 0.15

[quota.limits]
# Estimated messages per window, per model tier
opus = 50
sonnet = 225
haiku = 500

[budget]
# Maximum USD per autonomous task
max_task_usd = 2.0
# Maximum USD per day for autonomous execution
max_daily_usd = 10.0

[activity]
# Minutes of inactivity before the operator counts as idle
idle_threshold_minutes = 30
# Stop starting new tasks this many minutes before the predicted return
return_buffer_minutes = 15

[daemon]
# Seconds between scheduler ticks
poll_interval = 60
# Minutes between automatic quota syncs against the usage API (0 disables)
auto_sync_interval_minutes = 30

[assistant]
# Model for autonomous tasks: opus, sonnet, haiku, or a full model id
model = "sonnet"
# Let the policy pick a tier from task difficulty
auto_select_model = true
# Additional flags appended to every assistant invocation
extra_flags = []

[auto_tasks]
# Generate routine maintenance tasks from the built-in templates
enabled = false
# Repository the templates operate on
work_dir = "."

# Per-template overrides, e.g.:
# [auto_tasks.lint_check]
# enabled = false
# interval_hours = 24
"#;

//! Data model shared by every subsystem.
//!
//! Tasks, model tiers, and the usage/quota row types all live here. Status
//! and source enums round-trip through their database string forms; model
//! tiers carry the pricing table used for cost fallbacks.

use crate::core::error::MagpieError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Task status & source ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    AwaitingReview,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<TaskStatus, MagpieError> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "awaiting_review" => Ok(TaskStatus::AwaitingReview),
            "rejected" => Ok(TaskStatus::Rejected),
            other => Err(MagpieError::NotFound(format!("unknown status: {}", other))),
        }
    }

    /// Legal forward transitions. The crash-recovery sweep (running back to
    /// pending) bypasses this check deliberately.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Completed, TaskStatus::AwaitingReview)
                | (TaskStatus::AwaitingReview, TaskStatus::Completed)
                | (TaskStatus::AwaitingReview, TaskStatus::Rejected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Manual,
    CodeComment,
    QueueFile,
    AutoTemplate,
    Issue,
    Markdown,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Manual => "manual",
            TaskSource::CodeComment => "code_comment",
            TaskSource::QueueFile => "queue_file",
            TaskSource::AutoTemplate => "auto_template",
            TaskSource::Issue => "issue",
            TaskSource::Markdown => "markdown",
        }
    }

    pub fn parse(s: &str) -> Result<TaskSource, MagpieError> {
        match s {
            "manual" => Ok(TaskSource::Manual),
            "code_comment" => Ok(TaskSource::CodeComment),
            "queue_file" => Ok(TaskSource::QueueFile),
            "auto_template" => Ok(TaskSource::AutoTemplate),
            "issue" => Ok(TaskSource::Issue),
            "markdown" => Ok(TaskSource::Markdown),
            other => Err(MagpieError::NotFound(format!("unknown source: {}", other))),
        }
    }
}

// --- Model tiers ---

/// The three assistant model tiers, ordered cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

pub const ALL_TIERS: [ModelTier; 3] = [ModelTier::Opus, ModelTier::Sonnet, ModelTier::Haiku];

impl ModelTier {
    pub fn alias(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "haiku",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Opus => "opus",
        }
    }

    /// Full model id passed to the assistant CLI.
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "claude-haiku-4-5-20251001",
            ModelTier::Sonnet => "claude-sonnet-4-5-20250929",
            ModelTier::Opus => "claude-opus-4-6",
        }
    }

    /// Accepts both the short alias and the full model id.
    pub fn parse(s: &str) -> Result<ModelTier, MagpieError> {
        match s {
            "haiku" | "claude-haiku-4-5-20251001" => Ok(ModelTier::Haiku),
            "sonnet" | "claude-sonnet-4-5-20250929" => Ok(ModelTier::Sonnet),
            "opus" | "claude-opus-4-6" => Ok(ModelTier::Opus),
            other => Err(MagpieError::Config(format!("unknown model: {}", other))),
        }
    }

    /// One tier up; Opus stays Opus.
    pub fn upgraded(&self) -> ModelTier {
        match self {
            ModelTier::Haiku => ModelTier::Sonnet,
            ModelTier::Sonnet | ModelTier::Opus => ModelTier::Opus,
        }
    }

    /// One tier down, or None at the bottom of the ladder.
    pub fn downgraded(&self) -> Option<ModelTier> {
        match self {
            ModelTier::Opus => Some(ModelTier::Sonnet),
            ModelTier::Sonnet => Some(ModelTier::Haiku),
            ModelTier::Haiku => None,
        }
    }

    /// (input, output) USD per 1M tokens.
    pub fn cost_per_mtok(&self) -> (f64, f64) {
        match self {
            ModelTier::Haiku => (0.80, 4.00),
            ModelTier::Sonnet => (3.00, 15.00),
            ModelTier::Opus => (15.00, 75.00),
        }
    }

    pub fn cost_for(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        let (inp, out) = self.cost_per_mtok();
        input_tokens as f64 * inp / 1_000_000.0 + output_tokens as f64 * out / 1_000_000.0
    }

    /// Conservative per-message estimate used when the CLI reports no cost:
    /// ~4000 input + ~1000 output tokens at tier pricing.
    pub fn avg_message_cost(&self) -> f64 {
        self.cost_for(4000, 1000)
    }
}

/// What the operator asked for on the task, before policy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedModel {
    Auto,
    Tier(ModelTier),
}

impl RequestedModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestedModel::Auto => "auto",
            RequestedModel::Tier(t) => t.alias(),
        }
    }

    pub fn parse(s: &str) -> Result<RequestedModel, MagpieError> {
        if s.is_empty() || s == "auto" {
            return Ok(RequestedModel::Auto);
        }
        ModelTier::parse(s).map(RequestedModel::Tier)
    }
}

// --- Row types ---

/// One unit of autonomous work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub source: TaskSource,
    pub source_ref: Option<String>,
    pub requested_model: RequestedModelField,
    /// Tier actually dispatched with, set at claim time. Empty until then.
    pub model: String,
    pub priority: f64,
    pub status: TaskStatus,
    pub work_dir: String,
    pub branch_name: Option<String>,
    pub retry_count: i64,
    pub result_summary: String,
    pub actual_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Serializable wrapper so Task derives Serialize without a custom impl.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct RequestedModelField(pub String);

impl RequestedModelField {
    pub fn resolve(&self) -> Result<RequestedModel, MagpieError> {
        RequestedModel::parse(&self.0)
    }
}

/// Insert shape for new tasks; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub source: TaskSource,
    pub source_ref: Option<String>,
    pub requested_model: RequestedModel,
    pub priority: f64,
    pub work_dir: String,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub task_id: Option<i64>,
    pub autonomous: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageSample {
    pub ts: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct QuotaWindowRow {
    pub window_started_at: DateTime<Utc>,
    pub opus_used: i64,
    pub sonnet_used: i64,
    pub haiku_used: i64,
    pub last_correction_at: Option<DateTime<Utc>>,
}

impl QuotaWindowRow {
    pub fn used(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Opus => self.opus_used,
            ModelTier::Sonnet => self.sonnet_used,
            ModelTier::Haiku => self.haiku_used,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonMeta {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::AwaitingReview,
            TaskStatus::Rejected,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn transition_legality() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Completed.can_transition_to(TaskStatus::AwaitingReview));
        assert!(TaskStatus::AwaitingReview.can_transition_to(TaskStatus::Rejected));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Rejected.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn tier_ladder() {
        assert_eq!(ModelTier::Haiku.upgraded(), ModelTier::Sonnet);
        assert_eq!(ModelTier::Opus.upgraded(), ModelTier::Opus);
        assert_eq!(ModelTier::Opus.downgraded(), Some(ModelTier::Sonnet));
        assert_eq!(ModelTier::Haiku.downgraded(), None);
    }

    #[test]
    fn tier_accepts_alias_and_full_id() {
        assert_eq!(ModelTier::parse("sonnet").unwrap(), ModelTier::Sonnet);
        assert_eq!(
            ModelTier::parse("claude-opus-4-6").unwrap(),
            ModelTier::Opus
        );
        assert!(ModelTier::parse("gpt-4").is_err());
    }

    #[test]
    fn requested_model_parse() {
        assert_eq!(RequestedModel::parse("").unwrap(), RequestedModel::Auto);
        assert_eq!(RequestedModel::parse("auto").unwrap(), RequestedModel::Auto);
        assert_eq!(
            RequestedModel::parse("haiku").unwrap(),
            RequestedModel::Tier(ModelTier::Haiku)
        );
    }
}

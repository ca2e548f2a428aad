//! Shared types for the pipeline stage engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Stage vocabulary ────────────────────────────────────────────────

/// One of the five fixed pipeline stages.
///
/// Ordering is significant for funnel reporting only; any stage may move
/// to any other stage directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NeedsAction,
    AwaitingReply,
    Scheduled,
    Billing,
    Done,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::NeedsAction,
        Stage::AwaitingReply,
        Stage::Scheduled,
        Stage::Billing,
        Stage::Done,
    ];

    /// Zero-based position in the pipeline.
    pub fn position(self) -> usize {
        match self {
            Self::NeedsAction => 0,
            Self::AwaitingReply => 1,
            Self::Scheduled => 2,
            Self::Billing => 3,
            Self::Done => 4,
        }
    }

    /// The adjacent later stage, if any.
    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.position() + 1).copied()
    }

    /// Stable snake_case id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsAction => "needs_action",
            Self::AwaitingReply => "awaiting_reply",
            Self::Scheduled => "scheduled",
            Self::Billing => "billing",
            Self::Done => "done",
        }
    }

    /// Column title, color and default marker label.
    pub fn info(self) -> StageInfo {
        match self {
            Self::NeedsAction => StageInfo {
                title: "Needs Action",
                color: "bg-red-500",
                marker_label: None,
            },
            Self::AwaitingReply => StageInfo {
                title: "Awaiting Reply",
                color: "bg-orange-500",
                marker_label: Some("Venter på svar"),
            },
            Self::Scheduled => StageInfo {
                title: "Scheduled",
                color: "bg-green-500",
                marker_label: Some("I kalender"),
            },
            Self::Billing => StageInfo {
                title: "Billing",
                color: "bg-blue-500",
                marker_label: Some("Finance"),
            },
            Self::Done => StageInfo {
                title: "Done",
                color: "bg-gray-500",
                marker_label: Some("Afsluttet"),
            },
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::NeedsAction
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "needs_action" => Ok(Self::NeedsAction),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "scheduled" => Ok(Self::Scheduled),
            "billing" => Ok(Self::Billing),
            "done" => Ok(Self::Done),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Human-facing metadata for a stage column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    pub title: &'static str,
    pub color: &'static str,
    /// Label whose presence infers this stage (none for the entry stage).
    pub marker_label: Option<&'static str>,
}

/// Origin of a persisted stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    User,
    QuickAction,
    System,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::QuickAction => "quick_action",
            Self::System => "system",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "quick_action" => Ok(Self::QuickAction),
            "system" => Ok(Self::System),
            _ => Err(format!("Unknown trigger: {}", s)),
        }
    }
}

// ── Persisted records ───────────────────────────────────────────────

/// Durable, explicit stage assignment for one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRecord {
    pub thread_id: String,
    pub stage: Stage,
    pub triggered_by: TriggeredBy,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only transition audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub thread_id: String,
    /// `None` for the first explicit transition of a thread.
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub triggered_by: TriggeredBy,
    pub transitioned_at: DateTime<Utc>,
}

// ── External feed ───────────────────────────────────────────────────

/// Email card from the external feed. Read-only to the engine; only
/// `labels` feeds inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailCard {
    pub id: i64,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub from_email: String,
    pub snippet: String,
    pub is_unread: bool,
    pub is_starred: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// One reversible unit of a bulk label apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelOp {
    pub email_id: i64,
    pub label: String,
}

impl LabelOp {
    pub fn new(email_id: i64, label: impl Into<String>) -> Self {
        Self {
            email_id,
            label: label.into(),
        }
    }
}

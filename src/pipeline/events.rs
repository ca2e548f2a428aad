//! User-visible notifications, one per operation, never per batch item.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::pipeline::types::{Stage, TriggeredBy};

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Toast-level events consumed by the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardEvent {
    /// A stage change was persisted.
    StageMoved {
        thread_id: String,
        from: Stage,
        to: Stage,
        triggered_by: TriggeredBy,
    },
    /// Persisting a stage change failed; the card is now unconfirmed.
    TransitionFailed {
        thread_id: String,
        to: Stage,
        error: String,
        retryable: bool,
    },
    /// The request was invalid and nothing was changed.
    TransitionRejected { thread_id: String, reason: String },
    /// A bulk label batch finished.
    BatchApplied {
        batch_id: Uuid,
        applied: usize,
        failed: usize,
    },
    /// An undo finished (possibly partially).
    UndoCompleted {
        batch_id: Uuid,
        removed: usize,
        failed: usize,
    },
}

impl BoardEvent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StageMoved { .. } => "stage_moved",
            Self::TransitionFailed { .. } => "transition_failed",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::BatchApplied { .. } => "batch_applied",
            Self::UndoCompleted { .. } => "undo_completed",
        }
    }

    /// Toast text.
    pub fn message(&self) -> String {
        match self {
            Self::StageMoved { to, .. } => format!("Moved to '{}'", to.info().title),
            Self::TransitionFailed { to, error, .. } => {
                format!("Could not move to '{}': {error}", to.info().title)
            }
            Self::TransitionRejected { reason, .. } => format!("Move rejected: {reason}"),
            Self::BatchApplied {
                applied, failed, ..
            } => {
                if *failed == 0 {
                    format!("Applied {applied} labels")
                } else {
                    format!("Applied {applied} labels, {failed} failed")
                }
            }
            Self::UndoCompleted {
                removed, failed, ..
            } => {
                if *failed == 0 {
                    format!("Undid {removed} labels")
                } else {
                    format!("Undid {removed} labels, {failed} still applied")
                }
            }
        }
    }

    /// Whether the toast should render as an error.
    pub fn is_error(&self) -> bool {
        match self {
            Self::TransitionFailed { .. } | Self::TransitionRejected { .. } => true,
            Self::BatchApplied { failed, .. } | Self::UndoCompleted { failed, .. } => *failed > 0,
            Self::StageMoved { .. } => false,
        }
    }
}

/// Create the notification channel shared by controller and ledger.
pub fn channel(capacity: usize) -> broadcast::Sender<BoardEvent> {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    tx
}

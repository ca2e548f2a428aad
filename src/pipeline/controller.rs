//! Stage transition controller.
//!
//! Every stage change (drag-and-drop, quick action, system move) funnels
//! through [`TransitionController::request_transition`]: validate, skip
//! no-ops, update the cache optimistically, persist, then confirm or mark
//! the card unconfirmed.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::pipeline::cache::{ReconciliationCache, SyncState};
use crate::pipeline::events::BoardEvent;
use crate::pipeline::types::{PipelineRecord, Stage, TriggeredBy};
use crate::store::{PipelineStore, validate_thread_id};

/// Single-click shortcuts, each a fixed target stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickAction {
    SendQuote,
    ConfirmBooking,
    SendInvoice,
    Close,
}

impl QuickAction {
    pub const ALL: [QuickAction; 4] = [
        QuickAction::SendQuote,
        QuickAction::ConfirmBooking,
        QuickAction::SendInvoice,
        QuickAction::Close,
    ];

    pub fn target(self) -> Stage {
        match self {
            Self::SendQuote => Stage::AwaitingReply,
            Self::ConfirmBooking => Stage::Scheduled,
            Self::SendInvoice => Stage::Billing,
            Self::Close => Stage::Done,
        }
    }

    /// The stage whose cards show this action.
    pub fn offered_from(self) -> Stage {
        match self {
            Self::SendQuote => Stage::NeedsAction,
            Self::ConfirmBooking => Stage::AwaitingReply,
            Self::SendInvoice => Stage::Scheduled,
            Self::Close => Stage::Billing,
        }
    }

    /// Action offered on a card in `stage`, if any.
    pub fn available_for(stage: Stage) -> Option<QuickAction> {
        Self::ALL.into_iter().find(|a| a.offered_from() == stage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendQuote => "send_quote",
            Self::ConfirmBooking => "confirm_booking",
            Self::SendInvoice => "send_invoice",
            Self::Close => "close",
        }
    }

    /// Button text.
    pub fn title(self) -> &'static str {
        match self {
            Self::SendQuote => "Send Quote",
            Self::ConfirmBooking => "Confirm Booking",
            Self::SendInvoice => "Send Invoice",
            Self::Close => "Close",
        }
    }
}

impl std::fmt::Display for QuickAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuickAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown quick action: {s}"))
    }
}

/// What initiated a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Drag,
    QuickAction(QuickAction),
    System,
}

impl Origin {
    pub fn triggered_by(self) -> TriggeredBy {
        match self {
            Self::Drag => TriggeredBy::User,
            Self::QuickAction(_) => TriggeredBy::QuickAction,
            Self::System => TriggeredBy::System,
        }
    }
}

/// A validated, non-trivial stage change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionIntent {
    pub thread_id: String,
    pub from: Stage,
    pub to: Stage,
    pub triggered_by: TriggeredBy,
}

/// Result of a transition request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Source and target were equal; nothing happened.
    NoOp,
    /// The store accepted the write.
    Confirmed(PipelineRecord),
    /// The write failed; the card shows `to` as unconfirmed.
    Unconfirmed { to: Stage, error: StoreError },
}

impl TransitionOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// End of a drag gesture. `over` is `None` when dropped outside any column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragEnd {
    pub thread_id: String,
    pub over: Option<Stage>,
}

/// Validate a request and drop it when it would not change anything.
pub fn plan(
    thread_id: &str,
    from: Stage,
    to: Stage,
    origin: Origin,
) -> Result<Option<TransitionIntent>, StoreError> {
    validate_thread_id(thread_id)?;
    if from == to {
        return Ok(None);
    }
    Ok(Some(TransitionIntent {
        thread_id: thread_id.to_string(),
        from,
        to,
        triggered_by: origin.triggered_by(),
    }))
}

pub struct TransitionController {
    cache: Arc<RwLock<ReconciliationCache>>,
    store: Arc<dyn PipelineStore>,
    events: broadcast::Sender<BoardEvent>,
}

impl TransitionController {
    pub fn new(
        cache: Arc<RwLock<ReconciliationCache>>,
        store: Arc<dyn PipelineStore>,
        events: broadcast::Sender<BoardEvent>,
    ) -> Self {
        Self {
            cache,
            store,
            events,
        }
    }

    /// Move `thread_id` from `from` to `to`.
    ///
    /// Returns `Err` only when the request is rejected before anything
    /// changed (invalid thread id). Store failures come back as
    /// [`TransitionOutcome::Unconfirmed`].
    pub async fn request_transition(
        &self,
        thread_id: &str,
        from: Stage,
        to: Stage,
        origin: Origin,
    ) -> Result<TransitionOutcome, StoreError> {
        let intent = match plan(thread_id, from, to, origin) {
            Ok(Some(intent)) => intent,
            Ok(None) => {
                debug!(thread_id, stage = %to, "Transition is a no-op");
                return Ok(TransitionOutcome::NoOp);
            }
            Err(e) => {
                warn!(thread_id, error = %e, "Transition rejected");
                let _ = self.events.send(BoardEvent::TransitionRejected {
                    thread_id: thread_id.to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        Ok(self.execute(intent).await)
    }

    async fn execute(&self, intent: TransitionIntent) -> TransitionOutcome {
        let seq = self
            .cache
            .write()
            .await
            .begin(&intent.thread_id, intent.to, intent.triggered_by);

        match self
            .store
            .set_stage(&intent.thread_id, intent.to, intent.triggered_by)
            .await
        {
            Ok(record) => {
                self.cache.write().await.confirm(&record, seq);
                info!(
                    thread_id = %intent.thread_id,
                    from = %intent.from,
                    to = %intent.to,
                    triggered_by = %intent.triggered_by,
                    "Stage transition confirmed"
                );
                let _ = self.events.send(BoardEvent::StageMoved {
                    thread_id: intent.thread_id,
                    from: intent.from,
                    to: intent.to,
                    triggered_by: intent.triggered_by,
                });
                TransitionOutcome::Confirmed(record)
            }
            Err(e) => {
                self.cache.write().await.fail(&intent.thread_id, seq, &e);
                error!(
                    thread_id = %intent.thread_id,
                    to = %intent.to,
                    error = %e,
                    "Stage transition failed"
                );
                let _ = self.events.send(BoardEvent::TransitionFailed {
                    thread_id: intent.thread_id,
                    to: intent.to,
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                });
                TransitionOutcome::Unconfirmed { to: intent.to, error: e }
            }
        }
    }

    async fn current_stage(&self, thread_id: &str) -> Option<Stage> {
        self.cache.read().await.stage_of(thread_id)
    }

    /// Drop handler for the board. Dropping outside a column or onto the
    /// card's own column does nothing.
    pub async fn handle_drop(&self, drag: DragEnd) -> Result<TransitionOutcome, StoreError> {
        let Some(over) = drag.over else {
            return Ok(TransitionOutcome::NoOp);
        };
        let Some(from) = self.current_stage(&drag.thread_id).await else {
            debug!(thread_id = %drag.thread_id, "Dropped card is not on the board");
            return Ok(TransitionOutcome::NoOp);
        };
        self.request_transition(&drag.thread_id, from, over, Origin::Drag)
            .await
    }

    /// Run a quick action button.
    pub async fn quick_action(
        &self,
        thread_id: &str,
        action: QuickAction,
    ) -> Result<TransitionOutcome, StoreError> {
        let from = self.current_stage(thread_id).await.unwrap_or_default();
        self.request_transition(thread_id, from, action.target(), Origin::QuickAction(action))
            .await
    }

    /// Programmatic move (automations).
    pub async fn system_move(
        &self,
        thread_id: &str,
        to: Stage,
    ) -> Result<TransitionOutcome, StoreError> {
        let from = self.current_stage(thread_id).await.unwrap_or_default();
        self.request_transition(thread_id, from, to, Origin::System)
            .await
    }

    /// Re-issue a failed transition. `NoOp` when nothing is failed.
    pub async fn retry(&self, thread_id: &str) -> TransitionOutcome {
        let intent = {
            let cache = self.cache.read().await;
            match cache.get(thread_id) {
                Some(entry) => match &entry.sync {
                    SyncState::Failed { stage, origin, .. } => Some(TransitionIntent {
                        thread_id: thread_id.to_string(),
                        from: entry.base,
                        to: *stage,
                        triggered_by: *origin,
                    }),
                    _ => None,
                },
                None => None,
            }
        };
        match intent {
            Some(intent) => {
                info!(thread_id, to = %intent.to, "Retrying failed transition");
                self.execute(intent).await
            }
            None => TransitionOutcome::NoOp,
        }
    }

    /// Give up on a failed transition; returns the stage the card falls
    /// back to.
    pub async fn discard_failed(&self, thread_id: &str) -> Option<Stage> {
        self.cache.write().await.discard_failed(thread_id)
    }
}

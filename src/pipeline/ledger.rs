//! Bulk labeling with a bounded undo ledger.
//!
//! A batch of label applications runs concurrently; every label that was
//! actually added is recorded under one batch id so the whole batch can be
//! undone with a single `label.removeBatch` call.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::events::BoardEvent;
use crate::pipeline::labels::{
    ApplyLabelRequest, LabelChange, LabelService, MAX_CONFIDENCE, validate_confidence,
};
use crate::pipeline::types::LabelOp;

/// Confidence at or above which suggestions are applied automatically.
pub const HIGH_CONFIDENCE_THRESHOLD: u8 = 85;

/// Batches kept for undo by default. Only the latest is undoable.
pub const DEFAULT_UNDO_DEPTH: usize = 1;

/// Ops applied together under one id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelBatch {
    pub batch_id: Uuid,
    pub seq: u64,
    pub ops: Vec<LabelOp>,
    pub created_at: DateTime<Utc>,
}

/// A suggested label with the classifier's confidence (0-100).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSuggestion {
    pub email_id: i64,
    pub label: String,
    pub confidence: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub applied_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoReport {
    /// `None` when there was nothing to undo.
    pub batch_id: Option<Uuid>,
    pub removed_count: usize,
    pub failed_count: usize,
}

impl UndoReport {
    fn nothing() -> Self {
        Self {
            batch_id: None,
            removed_count: 0,
            failed_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoApplyReport {
    pub batch: Option<BatchReport>,
    /// Below threshold or invalid confidence.
    pub skipped: usize,
}

/// Bounded ring of recent batches, newest last.
#[derive(Debug)]
pub struct UndoLedger {
    capacity: usize,
    next_seq: u64,
    batches: VecDeque<LabelBatch>,
}

impl UndoLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_seq: 0,
            batches: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Start a batch. Evicts the oldest entries so the new batch fits.
    pub fn begin(&mut self) -> (Uuid, u64) {
        while self.batches.len() >= self.capacity {
            if let Some(evicted) = self.batches.pop_front() {
                debug!(batch_id = %evicted.batch_id, "Batch no longer undoable");
            }
        }
        self.next_seq += 1;
        (Uuid::new_v4(), self.next_seq)
    }

    /// Store the successful ops of a finished batch.
    pub fn record(&mut self, batch_id: Uuid, seq: u64, ops: Vec<LabelOp>) {
        self.restore(LabelBatch {
            batch_id,
            seq,
            ops,
            created_at: Utc::now(),
        });
    }

    /// Put a batch back, keeping seq order and the capacity bound.
    pub fn restore(&mut self, batch: LabelBatch) {
        let idx = self
            .batches
            .iter()
            .position(|b| b.seq > batch.seq)
            .unwrap_or(self.batches.len());
        self.batches.insert(idx, batch);
        while self.batches.len() > self.capacity {
            self.batches.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&LabelBatch> {
        self.batches.back()
    }

    pub fn take_latest(&mut self) -> Option<LabelBatch> {
        self.batches.pop_back()
    }
}

/// Applies batches through a [`LabelService`] and undoes the latest one.
pub struct BulkLabeler {
    labels: Arc<dyn LabelService>,
    ledger: Mutex<UndoLedger>,
    threshold: u8,
    events: broadcast::Sender<BoardEvent>,
}

impl BulkLabeler {
    pub fn new(
        labels: Arc<dyn LabelService>,
        undo_depth: usize,
        threshold: u8,
        events: broadcast::Sender<BoardEvent>,
    ) -> Self {
        Self {
            labels,
            ledger: Mutex::new(UndoLedger::new(undo_depth)),
            threshold,
            events,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// The batch the next `undo_last` would revert.
    pub async fn latest_batch(&self) -> Option<LabelBatch> {
        self.ledger.lock().await.latest().cloned()
    }

    /// Apply every op with full confidence. An empty batch touches nothing
    /// and reports the nil batch id.
    pub async fn apply_batch(&self, ops: Vec<LabelOp>) -> BatchReport {
        let requests = ops
            .into_iter()
            .map(|op| ApplyLabelRequest {
                email_id: op.email_id,
                label: op.label,
                confidence: MAX_CONFIDENCE as u8,
            })
            .collect();
        self.run_batch(requests).await
    }

    /// Apply the suggestions at or above the configured threshold.
    pub async fn auto_apply(&self, suggestions: Vec<LabelSuggestion>) -> AutoApplyReport {
        let mut skipped = 0;
        let mut requests = Vec::new();
        for s in suggestions {
            match validate_confidence(s.confidence) {
                Ok(confidence) if confidence >= self.threshold => requests.push(ApplyLabelRequest {
                    email_id: s.email_id,
                    label: s.label,
                    confidence,
                }),
                Ok(_) => skipped += 1,
                Err(e) => {
                    warn!(email_id = s.email_id, label = %s.label, error = %e, "Skipping suggestion");
                    skipped += 1;
                }
            }
        }

        let batch = if requests.is_empty() {
            None
        } else {
            Some(self.run_batch(requests).await)
        };
        AutoApplyReport { batch, skipped }
    }

    async fn run_batch(&self, requests: Vec<ApplyLabelRequest>) -> BatchReport {
        if requests.is_empty() {
            debug!("Empty label batch, undo ledger unchanged");
            return BatchReport {
                batch_id: Uuid::nil(),
                applied_count: 0,
                failed_count: 0,
            };
        }
        let (batch_id, seq) = self.ledger.lock().await.begin();

        let results = join_all(requests.iter().map(|r| self.labels.apply(r))).await;

        let mut applied_count = 0;
        let mut failed_count = 0;
        let mut undoable = Vec::new();
        for (request, result) in requests.into_iter().zip(results) {
            match result {
                Ok(LabelChange::Added) => {
                    applied_count += 1;
                    undoable.push(LabelOp::new(request.email_id, request.label));
                }
                Ok(LabelChange::AlreadyPresent) => applied_count += 1,
                Err(e) => {
                    failed_count += 1;
                    warn!(
                        batch_id = %batch_id,
                        email_id = request.email_id,
                        label = %request.label,
                        error = %e,
                        "Label apply failed"
                    );
                }
            }
        }

        self.ledger.lock().await.record(batch_id, seq, undoable);

        info!(
            batch_id = %batch_id,
            applied = applied_count,
            failed = failed_count,
            "Label batch applied"
        );
        let _ = self.events.send(BoardEvent::BatchApplied {
            batch_id,
            applied: applied_count,
            failed: failed_count,
        });

        BatchReport {
            batch_id,
            applied_count,
            failed_count,
        }
    }

    /// Remove every label of the latest batch. Ops that could not be
    /// removed stay undoable under the same batch id.
    pub async fn undo_last(&self) -> UndoReport {
        let Some(batch) = self.ledger.lock().await.take_latest() else {
            debug!("Nothing to undo");
            return UndoReport::nothing();
        };
        let batch_id = batch.batch_id;

        let (removed_count, failed_ops) = match self.labels.remove_batch(&batch.ops).await {
            Ok(response) => (response.removed, response.failed),
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Undo failed");
                (0, batch.ops.clone())
            }
        };
        let failed_count = failed_ops.len();

        if !failed_ops.is_empty() {
            self.ledger.lock().await.restore(LabelBatch {
                ops: failed_ops,
                ..batch
            });
        }

        info!(
            batch_id = %batch_id,
            removed = removed_count,
            failed = failed_count,
            "Label batch undone"
        );
        let _ = self.events.send(BoardEvent::UndoCompleted {
            batch_id,
            removed: removed_count,
            failed: failed_count,
        });

        UndoReport {
            batch_id: Some(batch_id),
            removed_count,
            failed_count,
        }
    }
}

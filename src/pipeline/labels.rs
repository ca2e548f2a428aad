//! Label service seam: the external `label.apply` / `label.removeBatch`
//! operations the bulk ledger drives.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LabelError;
use crate::pipeline::types::LabelOp;

/// Highest accepted suggestion confidence.
pub const MAX_CONFIDENCE: i32 = 100;

/// What `apply` actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelChange {
    /// The label was added.
    Added,
    /// The email already carried the label; nothing to undo.
    AlreadyPresent,
}

/// `label.apply` wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyLabelRequest {
    pub email_id: i64,
    pub label: String,
    pub confidence: u8,
}

/// `label.removeBatch` result. `failed` lists the ops left in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveBatchResponse {
    pub removed: usize,
    #[serde(default)]
    pub failed: Vec<LabelOp>,
}

/// Validate a 0-100 confidence score.
pub fn validate_confidence(confidence: i32) -> Result<u8, LabelError> {
    if (0..=MAX_CONFIDENCE).contains(&confidence) {
        Ok(confidence as u8)
    } else {
        Err(LabelError::InvalidConfidence(confidence))
    }
}

/// External label operations. Implementations do the I/O; batching, counting
/// and undo bookkeeping live in the ledger.
#[async_trait]
pub trait LabelService: Send + Sync {
    /// Apply one label to one email.
    async fn apply(&self, request: &ApplyLabelRequest) -> Result<LabelChange, LabelError>;

    /// Remove labels. Per-op failures are reported in the response; an
    /// `Err` means the whole call failed and nothing was removed.
    async fn remove_batch(&self, ops: &[LabelOp]) -> Result<RemoveBatchResponse, LabelError>;
}

/// In-process label service keeping per-email label lists.
///
/// Individual emails can be marked to fail applies or removals, which is how
/// partial-batch behavior is exercised.
#[derive(Default)]
pub struct InMemoryLabels {
    labels: RwLock<HashMap<i64, Vec<String>>>,
    fail_apply: RwLock<HashSet<i64>>,
    fail_remove: RwLock<HashSet<i64>>,
}

impl InMemoryLabels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the labels of an email.
    pub async fn set_labels(&self, email_id: i64, labels: Vec<String>) {
        self.labels.write().await.insert(email_id, labels);
    }

    /// Current labels of an email (empty when unknown).
    pub async fn labels_of(&self, email_id: i64) -> Vec<String> {
        self.labels
            .read()
            .await
            .get(&email_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every apply on `email_id` fail.
    pub async fn fail_applies_for(&self, email_id: i64) {
        self.fail_apply.write().await.insert(email_id);
    }

    /// Make every removal on `email_id` fail.
    pub async fn fail_removals_for(&self, email_id: i64) {
        self.fail_remove.write().await.insert(email_id);
    }

    /// Clear all injected failures.
    pub async fn heal(&self) {
        self.fail_apply.write().await.clear();
        self.fail_remove.write().await.clear();
    }
}

#[async_trait]
impl LabelService for InMemoryLabels {
    async fn apply(&self, request: &ApplyLabelRequest) -> Result<LabelChange, LabelError> {
        if self.fail_apply.read().await.contains(&request.email_id) {
            return Err(LabelError::ApplyFailed {
                email_id: request.email_id,
                label: request.label.clone(),
                reason: "simulated failure".into(),
            });
        }

        let mut labels = self.labels.write().await;
        let entry = labels.entry(request.email_id).or_default();
        if entry.iter().any(|l| l == &request.label) {
            debug!(email_id = request.email_id, label = %request.label, "Label already applied");
            return Ok(LabelChange::AlreadyPresent);
        }
        entry.push(request.label.clone());
        Ok(LabelChange::Added)
    }

    async fn remove_batch(&self, ops: &[LabelOp]) -> Result<RemoveBatchResponse, LabelError> {
        let failing = self.fail_remove.read().await.clone();
        let mut labels = self.labels.write().await;
        let mut response = RemoveBatchResponse::default();

        for op in ops {
            if failing.contains(&op.email_id) {
                response.failed.push(op.clone());
                continue;
            }
            if let Some(entry) = labels.get_mut(&op.email_id) {
                entry.retain(|l| l != &op.label);
            }
            response.removed += 1;
        }
        Ok(response)
    }
}

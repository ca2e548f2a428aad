//! `PipelineStore` trait — single async interface for pipeline persistence.
//!
//! The store is a dumb idempotent upsert keyed by thread id. It never judges
//! whether a transition is legal; that policy lives in the transition
//! controller.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::StoreError;
use crate::pipeline::types::{PipelineRecord, Stage, StageTransition, TriggeredBy};

/// Longest accepted thread id.
pub const MAX_THREAD_ID_LEN: usize = 256;

static THREAD_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:@+=\-]*$").unwrap());

/// Reject empty or malformed thread ids before any state is touched.
pub fn validate_thread_id(thread_id: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidThreadId {
        thread_id: thread_id.to_string(),
        reason: reason.to_string(),
    };

    if thread_id.is_empty() {
        return Err(invalid("empty"));
    }
    if thread_id.len() > MAX_THREAD_ID_LEN {
        return Err(invalid("too long"));
    }
    if !THREAD_ID_PATTERN.is_match(thread_id) {
        return Err(invalid("contains unsupported characters"));
    }
    Ok(())
}

/// Backend-agnostic pipeline state store.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Every explicit record. Threads without one use inference.
    async fn get_all(&self) -> Result<Vec<PipelineRecord>, StoreError>;

    /// Explicit records currently in `stage`.
    async fn get_by_stage(&self, stage: Stage) -> Result<Vec<PipelineRecord>, StoreError>;

    /// The record for one thread, if any.
    async fn get(&self, thread_id: &str) -> Result<Option<PipelineRecord>, StoreError>;

    /// Upsert the stage for a thread and append an audit row.
    async fn set_stage(
        &self,
        thread_id: &str,
        stage: Stage,
        triggered_by: TriggeredBy,
    ) -> Result<PipelineRecord, StoreError>;

    /// Remove the record of a deleted thread. Returns whether one existed.
    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError>;

    /// Audit log for a thread, oldest first.
    async fn transitions(&self, thread_id: &str) -> Result<Vec<StageTransition>, StoreError>;
}

//! Client reconciliation cache.
//!
//! Merges three sources into the single stage the board renders for each
//! thread: the explicit store record, label inference, and any optimistic
//! edit still in flight (or failed). Owned by one board session.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pipeline::rules::InferenceRules;
use crate::pipeline::types::{EmailCard, PipelineRecord, Stage, TriggeredBy};

/// Where the non-optimistic stage of an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    /// A `PipelineRecord` exists.
    Explicit,
    /// Derived from labels.
    Inferred,
}

/// Per-entry confirmation state of the displayed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// The displayed stage matches the store (or inference).
    Confirmed,
    /// An optimistic edit awaiting its `set_stage` response.
    Pending {
        stage: Stage,
        origin: TriggeredBy,
        seq: u64,
    },
    /// The `set_stage` call failed; the card keeps the attempted stage
    /// until it is retried or discarded.
    Failed {
        stage: Stage,
        origin: TriggeredBy,
        error: String,
        retryable: bool,
    },
}

/// One thread's reconciliation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Stage from the store record or from inference.
    pub base: Stage,
    pub source: StageSource,
    pub sync: SyncState,
}

impl CacheEntry {
    /// The stage the board shows.
    pub fn stage(&self) -> Stage {
        match &self.sync {
            SyncState::Confirmed => self.base,
            SyncState::Pending { stage, .. } | SyncState::Failed { stage, .. } => *stage,
        }
    }
}

/// The resolved view of one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStage {
    pub thread_id: String,
    pub stage: Stage,
    pub source: StageSource,
    pub sync: SyncState,
}

impl ResolvedStage {
    /// True while the displayed stage is not backed by the store.
    pub fn is_unconfirmed(&self) -> bool {
        !matches!(self.sync, SyncState::Confirmed)
    }
}

/// Conversion between two adjacent stages, as a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRate {
    pub from: Stage,
    pub to: Stage,
    pub rate: f64,
}

/// `to_count / from_count` as a percentage; 0 when `from_count` is 0.
pub fn conversion_rate(from_count: usize, to_count: usize) -> f64 {
    if from_count == 0 {
        return 0.0;
    }
    to_count as f64 / from_count as f64 * 100.0
}

/// What a refresh changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    pub pruned: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
struct FeedLabels {
    timestamp: DateTime<Utc>,
    labels: Vec<String>,
}

/// Per-session map `thread_id -> stage`.
#[derive(Debug)]
pub struct ReconciliationCache {
    rules: InferenceRules,
    feed: HashMap<String, FeedLabels>,
    records: HashMap<String, PipelineRecord>,
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

impl ReconciliationCache {
    pub fn new(rules: InferenceRules) -> Self {
        Self {
            rules,
            feed: HashMap::new(),
            records: HashMap::new(),
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn rules(&self) -> &InferenceRules {
        &self.rules
    }

    // ── Refresh ─────────────────────────────────────────────────────

    /// Replace the feed and the store snapshot in one pass. `as_of` is when
    /// the snapshot was requested.
    pub fn refresh(
        &mut self,
        feed: &[EmailCard],
        records: Vec<PipelineRecord>,
        as_of: DateTime<Utc>,
    ) -> RefreshSummary {
        self.load_feed(feed);
        self.load_records(records, as_of);
        self.rebuild()
    }

    /// The email feed changed.
    pub fn sync_feed(&mut self, feed: &[EmailCard]) -> RefreshSummary {
        self.load_feed(feed);
        self.rebuild()
    }

    /// A fresh `get_all()` snapshot, requested at `as_of`, arrived.
    pub fn sync_records(
        &mut self,
        records: Vec<PipelineRecord>,
        as_of: DateTime<Utc>,
    ) -> RefreshSummary {
        self.load_records(records, as_of);
        self.rebuild()
    }

    /// Threads sharing an id resolve from the newest card's labels.
    fn load_feed(&mut self, feed: &[EmailCard]) {
        let mut next: HashMap<String, FeedLabels> = HashMap::with_capacity(feed.len());
        for card in feed {
            let newer = next
                .get(&card.thread_id)
                .is_none_or(|existing| card.timestamp > existing.timestamp);
            if newer {
                next.insert(
                    card.thread_id.clone(),
                    FeedLabels {
                        timestamp: card.timestamp,
                        labels: card.labels.clone(),
                    },
                );
            }
        }
        self.feed = next;
    }

    /// Snapshot replaces the known records, except where a confirmed write
    /// seen by this session is newer than the snapshot's copy. A known record
    /// missing from the snapshot survives when it was written after `as_of`;
    /// deletions arrive through [`Self::remove_thread`].
    fn load_records(&mut self, records: Vec<PipelineRecord>, as_of: DateTime<Utc>) {
        let mut next: HashMap<String, PipelineRecord> = records
            .into_iter()
            .map(|r| (r.thread_id.clone(), r))
            .collect();
        for (thread_id, known) in &self.records {
            match next.get_mut(thread_id) {
                Some(incoming) if known.updated_at > incoming.updated_at => {
                    *incoming = known.clone();
                }
                Some(_) => {}
                None if known.updated_at > as_of => {
                    debug!(thread_id = %thread_id, "Keeping record written after snapshot");
                    next.insert(thread_id.clone(), known.clone());
                }
                None => {}
            }
        }
        self.records = next;
    }

    fn base_for(&self, thread_id: &str) -> (Stage, StageSource) {
        if let Some(record) = self.records.get(thread_id) {
            return (record.stage, StageSource::Explicit);
        }
        let labels = self
            .feed
            .get(thread_id)
            .map(|f| f.labels.as_slice())
            .unwrap_or_default();
        (self.rules.infer(labels), StageSource::Inferred)
    }

    fn rebuild(&mut self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut next = HashMap::with_capacity(self.feed.len());

        for thread_id in self.feed.keys() {
            let (base, source) = self.base_for(thread_id);
            let sync = match self.entries.get(thread_id) {
                Some(existing) => match &existing.sync {
                    SyncState::Failed { stage, .. } if source == StageSource::Explicit && *stage == base => {
                        debug!(thread_id = %thread_id, stage = %base, "Failed edit confirmed by store refresh");
                        SyncState::Confirmed
                    }
                    other => other.clone(),
                },
                None => {
                    summary.added += 1;
                    SyncState::Confirmed
                }
            };
            next.insert(thread_id.clone(), CacheEntry { base, source, sync });
        }

        summary.pruned = self
            .entries
            .keys()
            .filter(|id| !next.contains_key(*id))
            .count();
        summary.total = next.len();
        self.entries = next;

        if summary.added > 0 || summary.pruned > 0 {
            info!(
                added = summary.added,
                pruned = summary.pruned,
                total = summary.total,
                "Pipeline cache refreshed"
            );
        }
        summary
    }

    // ── Optimistic edits ────────────────────────────────────────────

    /// Show `stage` immediately. Returns the request sequence number, or
    /// `None` when the thread is not on the board.
    pub fn begin(&mut self, thread_id: &str, stage: Stage, origin: TriggeredBy) -> Option<u64> {
        let entry = self.entries.get_mut(thread_id)?;
        self.next_seq += 1;
        let seq = self.next_seq;
        entry.sync = SyncState::Pending { stage, origin, seq };
        debug!(thread_id, stage = %stage, seq, "Optimistic stage applied");
        Some(seq)
    }

    /// Record a successful write. Clears the optimistic edit only when `seq`
    /// is the latest request for the thread.
    pub fn confirm(&mut self, record: &PipelineRecord, seq: Option<u64>) -> bool {
        let newer = self
            .records
            .get(&record.thread_id)
            .is_none_or(|known| record.updated_at >= known.updated_at);
        if newer {
            self.records.insert(record.thread_id.clone(), record.clone());
        }

        let Some(entry) = self.entries.get_mut(&record.thread_id) else {
            debug!(thread_id = %record.thread_id, "Confirmed write for thread no longer on board");
            return false;
        };
        if newer {
            entry.base = record.stage;
            entry.source = StageSource::Explicit;
        }

        let resolved = match &entry.sync {
            SyncState::Pending { seq: pending, .. } => Some(*pending) == seq,
            SyncState::Failed { stage, .. } => *stage == entry.base,
            SyncState::Confirmed => false,
        };
        if resolved {
            entry.sync = SyncState::Confirmed;
        }
        resolved
    }

    /// Record a failed write. Ignored unless `seq` is the latest request.
    pub fn fail(&mut self, thread_id: &str, seq: Option<u64>, error: &StoreError) -> bool {
        let Some(entry) = self.entries.get_mut(thread_id) else {
            return false;
        };
        match entry.sync {
            SyncState::Pending {
                stage,
                origin,
                seq: pending,
            } if Some(pending) == seq => {
                warn!(thread_id, stage = %stage, error = %error, "Optimistic stage left unconfirmed");
                entry.sync = SyncState::Failed {
                    stage,
                    origin,
                    error: error.to_string(),
                    retryable: error.is_retryable(),
                };
                true
            }
            _ => false,
        }
    }

    /// Drop a failed edit and fall back to the base stage.
    pub fn discard_failed(&mut self, thread_id: &str) -> Option<Stage> {
        let entry = self.entries.get_mut(thread_id)?;
        if matches!(entry.sync, SyncState::Failed { .. }) {
            entry.sync = SyncState::Confirmed;
            info!(thread_id, stage = %entry.base, "Unconfirmed stage discarded");
            return Some(entry.base);
        }
        None
    }

    /// Forget a deleted thread entirely.
    pub fn remove_thread(&mut self, thread_id: &str) -> bool {
        self.records.remove(thread_id);
        self.feed.remove(thread_id);
        self.entries.remove(thread_id).is_some()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, thread_id: &str) -> Option<&CacheEntry> {
        self.entries.get(thread_id)
    }

    pub fn stage_of(&self, thread_id: &str) -> Option<Stage> {
        self.entries.get(thread_id).map(CacheEntry::stage)
    }

    pub fn resolve(&self, thread_id: &str) -> Option<ResolvedStage> {
        self.entries.get(thread_id).map(|entry| ResolvedStage {
            thread_id: thread_id.to_string(),
            stage: entry.stage(),
            source: entry.source,
            sync: entry.sync.clone(),
        })
    }

    /// Known explicit record for a thread (may outlive the feed entry).
    pub fn record(&self, thread_id: &str) -> Option<&PipelineRecord> {
        self.records.get(thread_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Threads currently shown in `stage`, sorted by id.
    pub fn threads_in(&self, stage: Stage) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.stage() == stage)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Threads whose displayed stage is pending or failed.
    pub fn unconfirmed(&self) -> Vec<ResolvedStage> {
        let mut out: Vec<ResolvedStage> = self
            .entries
            .keys()
            .filter_map(|id| self.resolve(id))
            .filter(ResolvedStage::is_unconfirmed)
            .collect();
        out.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        out
    }

    /// Count per stage; every stage is present.
    pub fn stage_counts(&self) -> BTreeMap<Stage, usize> {
        let mut counts: BTreeMap<Stage, usize> = Stage::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.entries.values() {
            *counts.entry(entry.stage()).or_default() += 1;
        }
        counts
    }

    /// Rates between each pair of adjacent stages.
    pub fn conversion_rates(&self) -> Vec<ConversionRate> {
        let counts = self.stage_counts();
        Stage::ALL
            .iter()
            .filter_map(|from| from.next().map(|to| (*from, to)))
            .map(|(from, to)| ConversionRate {
                from,
                to,
                rate: conversion_rate(counts[&from], counts[&to]),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: i64, thread_id: &str, labels: &[&str]) -> EmailCard {
        EmailCard {
            id,
            thread_id: thread_id.into(),
            subject: format!("Subject {id}"),
            from: "Alice".into(),
            from_email: "alice@example.com".into(),
            snippet: String::new(),
            is_unread: true,
            is_starred: false,
            timestamp: Utc::now(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn record(thread_id: &str, stage: Stage) -> PipelineRecord {
        PipelineRecord {
            thread_id: thread_id.into(),
            stage,
            triggered_by: TriggeredBy::User,
            updated_at: Utc::now(),
        }
    }

    fn cache() -> ReconciliationCache {
        ReconciliationCache::new(InferenceRules::default())
    }

    #[test]
    fn inference_fills_threads_without_records() {
        let mut c = cache();
        c.refresh(&[card(1, "t1", &["Finance"]), card(2, "t2", &[])], vec![], Utc::now());

        let t1 = c.resolve("t1").unwrap();
        assert_eq!(t1.stage, Stage::Billing);
        assert_eq!(t1.source, StageSource::Inferred);
        assert_eq!(c.stage_of("t2"), Some(Stage::NeedsAction));
    }

    #[test]
    fn explicit_record_wins_over_labels() {
        let mut c = cache();
        c.refresh(&[card(1, "t1", &["Finance"])], vec![record("t1", Stage::Done)], Utc::now());
        let t1 = c.resolve("t1").unwrap();
        assert_eq!(t1.stage, Stage::Done);
        assert_eq!(t1.source, StageSource::Explicit);
        assert_eq!(t1.sync, SyncState::Confirmed);
    }

    #[test]
    fn every_thread_resolves_to_exactly_one_stage() {
        let mut c = cache();
        let feed = vec![
            card(1, "a", &["Venter på svar", "I kalender"]),
            card(2, "b", &["Finance"]),
            card(3, "c", &[]),
            card(4, "d", &["Afsluttet"]),
        ];
        c.refresh(&feed, vec![record("b", Stage::Scheduled)], Utc::now());
        c.begin("c", Stage::Done, TriggeredBy::User);

        let total: usize = c.stage_counts().values().sum();
        assert_eq!(total, feed.len());
        for thread in ["a", "b", "c", "d"] {
            let in_columns = Stage::ALL
                .iter()
                .filter(|s| c.threads_in(**s).contains(&thread.to_string()))
                .count();
            assert_eq!(in_columns, 1, "thread {thread} must be in exactly one column");
        }
    }

    #[test]
    fn refresh_adds_and_prunes() {
        let mut c = cache();
        let first = c.sync_feed(&[card(1, "t1", &[]), card(2, "t2", &[])]);
        assert_eq!(first, RefreshSummary { added: 2, pruned: 0, total: 2 });

        let second = c.sync_feed(&[card(2, "t2", &[]), card(3, "t3", &[])]);
        assert_eq!(second, RefreshSummary { added: 1, pruned: 1, total: 2 });
        assert!(c.get("t1").is_none());
    }

    #[test]
    fn pruned_thread_keeps_record_in_snapshot_only() {
        let mut c = cache();
        c.refresh(&[card(1, "t1", &[])], vec![record("t1", Stage::Done)], Utc::now());
        c.sync_feed(&[]);
        assert!(c.resolve("t1").is_none());
        assert!(c.record("t1").is_some());
    }

    #[test]
    fn duplicate_thread_uses_newest_card_labels() {
        let mut c = cache();
        let mut old = card(1, "t1", &["Finance"]);
        old.timestamp = Utc::now() - chrono::Duration::hours(1);
        let new = card(2, "t1", &["Afsluttet"]);
        c.sync_feed(&[new, old]);
        assert_eq!(c.len(), 1);
        assert_eq!(c.stage_of("t1"), Some(Stage::Done));
    }

    #[test]
    fn optimistic_edit_shows_immediately_and_confirms() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &[])]);

        let seq = c.begin("t1", Stage::AwaitingReply, TriggeredBy::QuickAction);
        assert!(seq.is_some());
        let pending = c.resolve("t1").unwrap();
        assert_eq!(pending.stage, Stage::AwaitingReply);
        assert!(pending.is_unconfirmed());

        let mut rec = record("t1", Stage::AwaitingReply);
        rec.triggered_by = TriggeredBy::QuickAction;
        assert!(c.confirm(&rec, seq));
        let confirmed = c.resolve("t1").unwrap();
        assert_eq!(confirmed.stage, Stage::AwaitingReply);
        assert_eq!(confirmed.source, StageSource::Explicit);
        assert_eq!(confirmed.sync, SyncState::Confirmed);
    }

    #[test]
    fn begin_on_unknown_thread_is_none() {
        let mut c = cache();
        assert!(c.begin("ghost", Stage::Done, TriggeredBy::System).is_none());
    }

    #[test]
    fn stale_response_does_not_clear_newer_edit() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &[])]);
        let first = c.begin("t1", Stage::Scheduled, TriggeredBy::User);
        let second = c.begin("t1", Stage::Billing, TriggeredBy::User);

        assert!(!c.confirm(&record("t1", Stage::Scheduled), first));
        let still = c.resolve("t1").unwrap();
        assert_eq!(still.stage, Stage::Billing);
        assert!(still.is_unconfirmed());

        let err = StoreError::Unavailable("timeout".into());
        assert!(!c.fail("t1", first, &err));

        assert!(c.confirm(&record("t1", Stage::Billing), second));
        assert_eq!(c.stage_of("t1"), Some(Stage::Billing));
    }

    #[test]
    fn failed_edit_stays_visible_until_discarded() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &["Finance"])]);
        let seq = c.begin("t1", Stage::Done, TriggeredBy::User);
        let err = StoreError::Unavailable("offline".into());
        assert!(c.fail("t1", seq, &err));

        let failed = c.resolve("t1").unwrap();
        assert_eq!(failed.stage, Stage::Done);
        match failed.sync {
            SyncState::Failed { retryable, .. } => assert!(retryable),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(c.unconfirmed().len(), 1);

        assert_eq!(c.discard_failed("t1"), Some(Stage::Billing));
        assert_eq!(c.stage_of("t1"), Some(Stage::Billing));
        assert!(c.unconfirmed().is_empty());
    }

    #[test]
    fn refresh_matching_failed_stage_confirms_it() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &[])]);
        let seq = c.begin("t1", Stage::Scheduled, TriggeredBy::User);
        c.fail("t1", seq, &StoreError::Unavailable("x".into()));

        c.sync_records(vec![record("t1", Stage::Scheduled)], Utc::now());
        assert_eq!(c.resolve("t1").unwrap().sync, SyncState::Confirmed);
    }

    #[test]
    fn pending_edit_survives_refresh() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &[])]);
        c.begin("t1", Stage::Done, TriggeredBy::User);
        c.sync_records(vec![record("t1", Stage::Billing)], Utc::now());
        assert_eq!(c.stage_of("t1"), Some(Stage::Done));
    }

    #[test]
    fn older_snapshot_does_not_roll_back_confirmed_write() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &[])]);
        let mut stale = record("t1", Stage::Scheduled);
        stale.updated_at = Utc::now() - chrono::Duration::minutes(5);

        let seq = c.begin("t1", Stage::Done, TriggeredBy::User);
        c.confirm(&record("t1", Stage::Done), seq);
        c.sync_records(vec![stale], Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(c.stage_of("t1"), Some(Stage::Done));
    }

    #[test]
    fn snapshot_requested_before_first_write_keeps_it() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &["Finance"])]);
        let requested_at = Utc::now() - chrono::Duration::seconds(1);

        let seq = c.begin("t1", Stage::Done, TriggeredBy::User);
        assert!(c.confirm(&record("t1", Stage::Done), seq));
        c.sync_records(vec![], requested_at);

        let t1 = c.resolve("t1").unwrap();
        assert_eq!(t1.stage, Stage::Done);
        assert_eq!(t1.source, StageSource::Explicit);
        assert_eq!(t1.sync, SyncState::Confirmed);
    }

    #[test]
    fn snapshot_after_write_drops_missing_record() {
        let mut c = cache();
        c.sync_feed(&[card(1, "t1", &["Finance"])]);
        let mut rec = record("t1", Stage::Done);
        rec.updated_at = Utc::now() - chrono::Duration::minutes(5);
        c.confirm(&rec, None);
        assert_eq!(c.stage_of("t1"), Some(Stage::Done));

        c.sync_records(vec![], Utc::now());
        let t1 = c.resolve("t1").unwrap();
        assert_eq!(t1.stage, Stage::Billing);
        assert_eq!(t1.source, StageSource::Inferred);
    }

    #[test]
    fn conversion_rates_guard_zero_denominator() {
        let mut c = cache();
        c.sync_feed(&[
            card(1, "a", &[]),
            card(2, "b", &[]),
            card(3, "c", &["Venter på svar"]),
        ]);
        let rates = c.conversion_rates();
        assert_eq!(rates.len(), 4);
        assert_eq!(rates[0].from, Stage::NeedsAction);
        assert!((rates[0].rate - 50.0).abs() < f64::EPSILON);
        // nothing in scheduled
        let from_scheduled = rates.iter().find(|r| r.from == Stage::Scheduled).unwrap();
        assert_eq!(from_scheduled.rate, 0.0);
        assert!(rates.iter().all(|r| r.rate.is_finite()));
    }

    #[test]
    fn conversion_rate_fn() {
        assert_eq!(conversion_rate(0, 5), 0.0);
        assert_eq!(conversion_rate(4, 1), 25.0);
    }

    #[test]
    fn stage_counts_include_empty_stages() {
        let c = cache();
        let counts = c.stage_counts();
        assert_eq!(counts.len(), 5);
        assert!(counts.values().all(|n| *n == 0));
    }

    #[test]
    fn remove_thread_forgets_everything() {
        let mut c = cache();
        c.refresh(&[card(1, "t1", &[])], vec![record("t1", Stage::Done)], Utc::now());
        assert!(c.remove_thread("t1"));
        assert!(c.get("t1").is_none());
        assert!(c.record("t1").is_none());
    }
}

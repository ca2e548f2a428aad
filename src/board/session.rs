//! Board session: one user's board, wiring the cache, controller and bulk
//! labeler to a store and a label service.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use super::model::{BoardCard, BoardColumn, DragSensorConfig};
use crate::api::StoreEvent;
use crate::config::BoardConfig;
use crate::context::{self, SessionAction, SessionContext};
use crate::error::StoreError;
use crate::pipeline::cache::{ConversionRate, ReconciliationCache, RefreshSummary, ResolvedStage};
use crate::pipeline::controller::{DragEnd, QuickAction, TransitionController, TransitionOutcome};
use crate::pipeline::events::{self, BoardEvent};
use crate::pipeline::labels::LabelService;
use crate::pipeline::ledger::BulkLabeler;
use crate::pipeline::types::{EmailCard, Stage};
use crate::store::PipelineStore;

pub struct BoardSession {
    cache: Arc<RwLock<ReconciliationCache>>,
    store: Arc<dyn PipelineStore>,
    feed: RwLock<Vec<EmailCard>>,
    controller: TransitionController,
    labeler: BulkLabeler,
    events: broadcast::Sender<BoardEvent>,
    drag: DragSensorConfig,
    context: RwLock<SessionContext>,
}

impl BoardSession {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        labels: Arc<dyn LabelService>,
        config: BoardConfig,
    ) -> Self {
        let events = events::channel(config.event_capacity);
        let cache = Arc::new(RwLock::new(ReconciliationCache::new(config.inference)));
        let controller = TransitionController::new(cache.clone(), store.clone(), events.clone());
        let labeler = BulkLabeler::new(
            labels,
            config.undo_depth,
            config.auto_apply_threshold,
            events.clone(),
        );
        Self {
            cache,
            store,
            feed: RwLock::new(Vec::new()),
            controller,
            labeler,
            events,
            drag: config.drag,
            context: RwLock::new(SessionContext::default()),
        }
    }

    /// Build a session with configuration read from the environment.
    pub fn from_env(
        store: Arc<dyn PipelineStore>,
        labels: Arc<dyn LabelService>,
    ) -> crate::error::Result<Self> {
        Ok(Self::new(store, labels, BoardConfig::from_env()?))
    }

    /// Seed the board from a feed and the store snapshot.
    ///
    /// When the store is unreachable the feed is still loaded (every card
    /// shows its inferred stage) and the error is returned.
    pub async fn load(&self, feed: Vec<EmailCard>) -> Result<RefreshSummary, StoreError> {
        let as_of = Utc::now();
        let records = self.store.get_all().await;
        let result = {
            let mut cache = self.cache.write().await;
            match records {
                Ok(records) => Ok(cache.refresh(&feed, records, as_of)),
                Err(e) => {
                    warn!(error = %e, "Store snapshot unavailable, showing inferred stages");
                    cache.sync_feed(&feed);
                    Err(e)
                }
            }
        };
        let gone: Vec<String> = {
            let context = self.context.read().await;
            [
                &context.selected_thread,
                &context.dragging_thread,
                &context.preview_thread,
            ]
            .into_iter()
            .flatten()
            .filter(|id| !feed.iter().any(|c| &c.thread_id == *id))
            .cloned()
            .collect()
        };
        *self.feed.write().await = feed;
        for thread_id in gone {
            self.dispatch(SessionAction::ThreadRemoved(thread_id)).await;
        }
        result
    }

    /// Re-read the store snapshot, keeping the current feed.
    pub async fn refresh_records(&self) -> Result<RefreshSummary, StoreError> {
        let as_of = Utc::now();
        let records = self.store.get_all().await?;
        Ok(self.cache.write().await.sync_records(records, as_of))
    }

    /// Apply a live event from the store's WebSocket.
    pub async fn apply_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::RecordsSync { records, as_of } => {
                self.cache.write().await.sync_records(records, as_of);
            }
            StoreEvent::SyncFailed { error, retryable } => {
                warn!(error = %error, retryable, "Store snapshot failed, keeping cached stages");
            }
            StoreEvent::StageSet { record } => {
                debug!(thread_id = %record.thread_id, stage = %record.stage, "Remote stage update");
                self.cache.write().await.confirm(&record, None);
            }
            StoreEvent::ThreadDeleted { thread_id } => {
                self.feed.write().await.retain(|c| c.thread_id != thread_id);
                if self.cache.write().await.remove_thread(&thread_id) {
                    info!(thread_id = %thread_id, "Thread removed from board");
                }
                self.dispatch(SessionAction::ThreadRemoved(thread_id)).await;
            }
        }
    }

    /// Current view and selection state.
    pub async fn context(&self) -> SessionContext {
        self.context.read().await.clone()
    }

    /// Apply a context action and return the new context.
    pub async fn dispatch(&self, action: SessionAction) -> SessionContext {
        let mut current = self.context.write().await;
        *current = context::reduce(&current, action);
        current.clone()
    }

    /// A card was picked up. Ignored for threads not on the board.
    pub async fn drag_started(&self, thread_id: &str) -> bool {
        if self.cache.read().await.get(thread_id).is_none() {
            return false;
        }
        self.dispatch(SessionAction::DragStarted(thread_id.to_string()))
            .await;
        true
    }

    /// A drag ended: clear the drag state, then move the card if it was
    /// dropped on another column.
    pub async fn handle_drop(&self, drag: DragEnd) -> Result<TransitionOutcome, StoreError> {
        self.dispatch(SessionAction::DragEnded).await;
        self.controller.handle_drop(drag).await
    }

    /// Columns in stage order, each holding the newest card per thread.
    pub async fn columns(&self) -> Vec<BoardColumn> {
        let feed = self.feed.read().await;
        let cache = self.cache.read().await;

        let mut newest: HashMap<&str, &EmailCard> = HashMap::new();
        for card in feed.iter() {
            let slot = newest.entry(card.thread_id.as_str()).or_insert(card);
            if card.timestamp > slot.timestamp {
                *slot = card;
            }
        }

        let mut columns: Vec<BoardColumn> =
            Stage::ALL.iter().map(|s| BoardColumn::empty(*s)).collect();
        for card in newest.into_values() {
            let Some(resolved) = cache.resolve(&card.thread_id) else {
                continue;
            };
            columns[resolved.stage.position()].cards.push(BoardCard {
                email: card.clone(),
                stage: resolved.stage,
                quick_action: QuickAction::available_for(resolved.stage),
                sync: resolved.sync,
            });
        }
        for column in &mut columns {
            column
                .cards
                .sort_by(|a, b| b.email.timestamp.cmp(&a.email.timestamp));
        }
        columns
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub fn controller(&self) -> &TransitionController {
        &self.controller
    }

    pub fn labeler(&self) -> &BulkLabeler {
        &self.labeler
    }

    pub fn drag_sensor(&self) -> DragSensorConfig {
        self.drag
    }

    pub async fn stage_counts(&self) -> BTreeMap<Stage, usize> {
        self.cache.read().await.stage_counts()
    }

    pub async fn conversion_rates(&self) -> Vec<ConversionRate> {
        self.cache.read().await.conversion_rates()
    }

    pub async fn resolve(&self, thread_id: &str) -> Option<ResolvedStage> {
        self.cache.read().await.resolve(thread_id)
    }

    pub async fn stage_of(&self, thread_id: &str) -> Option<Stage> {
        self.cache.read().await.stage_of(thread_id)
    }
}

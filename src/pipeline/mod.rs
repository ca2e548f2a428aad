//! Pipeline core.
//!
//! Stage changes flow through:
//! 1. `TransitionController` — validate, optimistic update, persist
//! 2. `ReconciliationCache` — merge store records, label inference and
//!    in-flight edits into one stage per thread
//! 3. `BoardEvent` — one notification per operation
//!
//! Bulk labeling lives beside it in `ledger`, with undo of the latest batch.

pub mod cache;
pub mod controller;
pub mod events;
pub mod labels;
pub mod ledger;
pub mod rules;
pub mod types;

pub use cache::{ReconciliationCache, ResolvedStage, StageSource, SyncState};
pub use controller::{DragEnd, Origin, QuickAction, TransitionController, TransitionOutcome};
pub use events::BoardEvent;
pub use labels::{InMemoryLabels, LabelService};
pub use ledger::{BulkLabeler, LabelSuggestion, UndoLedger};
pub use rules::InferenceRules;
pub use types::{EmailCard, LabelOp, PipelineRecord, Stage, StageTransition, TriggeredBy};

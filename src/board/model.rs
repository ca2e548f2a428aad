//! Board view model — columns of cards as the UI renders them.

use serde::{Deserialize, Serialize};

use crate::pipeline::cache::SyncState;
use crate::pipeline::controller::QuickAction;
use crate::pipeline::types::{EmailCard, Stage};

/// Pointer sensor settings for drag-and-drop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragSensorConfig {
    /// Pointer travel before a press becomes a drag, so clicks still open
    /// the card.
    pub activation_distance_px: f64,
    pub keyboard_enabled: bool,
}

impl Default for DragSensorConfig {
    fn default() -> Self {
        Self {
            activation_distance_px: 8.0,
            keyboard_enabled: true,
        }
    }
}

impl DragSensorConfig {
    /// Whether a pointer moved by `(dx, dy)` starts a drag.
    pub fn activates(&self, dx: f64, dy: f64) -> bool {
        dx.hypot(dy) > self.activation_distance_px
    }
}

/// One card on the board.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardCard {
    pub email: EmailCard,
    pub stage: Stage,
    pub sync: SyncState,
    pub quick_action: Option<QuickAction>,
}

impl BoardCard {
    /// Render the "unconfirmed" badge.
    pub fn is_unconfirmed(&self) -> bool {
        !matches!(self.sync, SyncState::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardColumn {
    pub stage: Stage,
    pub title: &'static str,
    pub color: &'static str,
    /// Newest first.
    pub cards: Vec<BoardCard>,
}

impl BoardColumn {
    pub fn empty(stage: Stage) -> Self {
        let info = stage.info();
        Self {
            stage,
            title: info.title,
            color: info.color,
            cards: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

//! Session context: view, folder and selection state passed to the board
//! explicitly and changed only through [`reduce`].

use serde::{Deserialize, Serialize};

/// Which main view is showing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    #[default]
    Inbox,
    Pipeline,
    Dashboard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub view: View,
    pub folder: String,
    pub selected_thread: Option<String>,
    /// Thread whose card is being dragged.
    pub dragging_thread: Option<String>,
    pub preview_thread: Option<String>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            view: View::default(),
            folder: "INBOX".to_string(),
            selected_thread: None,
            dragging_thread: None,
            preview_thread: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    SwitchView(View),
    /// Changing folder clears selection and preview.
    OpenFolder(String),
    Select(String),
    ClearSelection,
    DragStarted(String),
    DragEnded,
    OpenPreview(String),
    ClosePreview,
    /// A thread left the feed or was deleted.
    ThreadRemoved(String),
}

/// Pure state transition.
pub fn reduce(context: &SessionContext, action: SessionAction) -> SessionContext {
    let mut next = context.clone();
    match action {
        SessionAction::SwitchView(view) => {
            next.view = view;
            next.dragging_thread = None;
        }
        SessionAction::OpenFolder(folder) => {
            if folder != next.folder {
                next.folder = folder;
                next.selected_thread = None;
                next.preview_thread = None;
            }
        }
        SessionAction::Select(thread_id) => next.selected_thread = Some(thread_id),
        SessionAction::ClearSelection => next.selected_thread = None,
        SessionAction::DragStarted(thread_id) => next.dragging_thread = Some(thread_id),
        SessionAction::DragEnded => next.dragging_thread = None,
        SessionAction::OpenPreview(thread_id) => {
            next.selected_thread = Some(thread_id.clone());
            next.preview_thread = Some(thread_id);
        }
        SessionAction::ClosePreview => next.preview_thread = None,
        SessionAction::ThreadRemoved(thread_id) => {
            for slot in [
                &mut next.selected_thread,
                &mut next.dragging_thread,
                &mut next.preview_thread,
            ] {
                if slot.as_deref() == Some(thread_id.as_str()) {
                    *slot = None;
                }
            }
        }
    }
    next
}

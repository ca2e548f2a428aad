//! Kanban board: view model and the per-user session facade.

pub mod model;
pub mod session;

pub use crate::pipeline::controller::DragEnd;
pub use model::{BoardCard, BoardColumn, DragSensorConfig};
pub use session::BoardSession;

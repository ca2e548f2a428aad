//! Pipeline Board: email threads tracked through a sales pipeline.

pub mod api;
pub mod board;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod store;

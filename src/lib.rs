//! Pawnshop precious-metal price board.
//!
//! Keeps the current and previous rate generations in a durable cache,
//! works out which flip-board digits must be added when prices move, and
//! refreshes on a fixed daily schedule.

pub mod api;
pub mod cache;
pub mod config;
pub mod digits;
pub mod error;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod sync;

pub use error::{Error, Result};
pub use models::{DigitWorkItem, Generation, RateRecord, Snapshot};

//! Database module: entity models and SQL repositories.
//!
//! - `model`: row-level view models that only the repositories produce.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `keyword_scout::db`; the repository API is re-exported
//! here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{AiReplyLog, LockRow, UserSeed};

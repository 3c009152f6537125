pub mod config;
pub mod credentials;
pub mod cursor;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod gates;
pub mod kv;
pub mod lock;
pub mod model;
pub mod notify;
pub mod relevance;
pub mod scan;
pub mod search;
pub mod server;
pub mod services;
pub mod webhook;

pub use error::{ScoutError, ScoutResult};

//! Data layer module
//!
//! Handles all data persistence:
//! - Actors (local and cached remote)
//! - Follow requests and follow edges
//! - Statuses and favorites
//! - Notifications

mod database;
mod models;

pub use database::{Database, UnfollowOutcome};
pub use models::*;

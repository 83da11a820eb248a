//! Data layer module
//!
//! Handles all persistence:
//! - SQLite database operations
//! - Row models and cached remote facts

mod database;
mod models;

pub use database::Database;
pub use models::*;

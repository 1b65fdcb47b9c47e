//! Local value storage.

mod bag;
mod database;
mod entity;
pub mod expiration;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::common::MAX_VALUE_SIZE;

pub use bag::{can_replace, BagStore, DhtValueBag};
pub use database::{Database, StoreResult};
pub use entity::DhtValueEntity;

pub const DEFAULT_MAX_DATABASE_SIZE: usize = 16_384;
pub const DEFAULT_MAX_VALUES_PER_KEY: usize = 5;
/// Default time a value is kept by the nodes closest to its key.
pub const DEFAULT_VALUE_EXPIRATION: Duration = Duration::from_secs(60 * 60); // 1 hour

/// A database shared between the dispatcher thread and the republisher.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Locks the database, recovering it if another thread panicked while holding it.
pub fn lock(database: &SharedDatabase) -> MutexGuard<'_, Database> {
    database.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Maximum number of remote values across all keys.
    ///
    /// Defaults to [DEFAULT_MAX_DATABASE_SIZE]
    pub max_database_size: usize,
    /// Maximum number of remote values under one primary key.
    ///
    /// Defaults to [DEFAULT_MAX_VALUES_PER_KEY]
    pub max_values_per_key: usize,
    /// Time to live of values stored by the nodes closest to their key.
    ///
    /// Defaults to [DEFAULT_VALUE_EXPIRATION]
    pub value_expiration: Duration,
    /// Largest accepted value payload.
    ///
    /// Defaults to [MAX_VALUE_SIZE]
    pub max_value_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            max_database_size: DEFAULT_MAX_DATABASE_SIZE,
            max_values_per_key: DEFAULT_MAX_VALUES_PER_KEY,
            value_expiration: DEFAULT_VALUE_EXPIRATION,
            max_value_size: MAX_VALUE_SIZE,
        }
    }
}

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::Kuid;

use super::bag::{BagStore, DhtValueBag};
use super::{DatabaseSettings, DhtValueEntity};

#[derive(Debug, Clone, PartialEq)]
/// Outcome of [Database::store].
pub enum StoreResult {
    Stored,
    Removed,
    Rejected(&'static str),
}

impl StoreResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, StoreResult::Rejected(_))
    }
}

#[derive(Debug)]
/// In memory value store: primary key to a bag of values keyed by creator.
///
/// Local values are always admitted and never expire.
pub struct Database {
    settings: DatabaseSettings,
    bags: HashMap<Kuid, DhtValueBag>,
    value_count: usize,
}

impl Database {
    pub fn new(settings: DatabaseSettings) -> Self {
        Database {
            settings,
            bags: HashMap::new(),
            value_count: 0,
        }
    }

    // === Getters ===

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    /// Number of primary keys.
    pub fn key_count(&self) -> usize {
        self.bags.len()
    }

    /// Number of values across every key.
    pub fn value_count(&self) -> usize {
        self.value_count
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    pub fn keys(&self) -> Vec<Kuid> {
        self.bags.keys().copied().collect()
    }

    /// Returns a copy of every value stored under `primary_key`, by secondary key.
    pub fn get(&self, primary_key: &Kuid) -> HashMap<Kuid, DhtValueEntity> {
        self.bags
            .get(primary_key)
            .map(|bag| {
                bag.values()
                    .map(|entity| (*entity.secondary_key(), entity.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_value(&self, primary_key: &Kuid, secondary_key: &Kuid) -> Option<&DhtValueEntity> {
        self.bags
            .get(primary_key)
            .and_then(|bag| bag.get(secondary_key))
    }

    pub fn contains(&self, primary_key: &Kuid, secondary_key: &Kuid) -> bool {
        self.get_value(primary_key, secondary_key).is_some()
    }

    /// A snapshot of every stored value, unaffected by later changes.
    pub fn values(&self) -> Vec<DhtValueEntity> {
        self.bags
            .values()
            .flat_map(|bag| bag.values().cloned())
            .collect()
    }

    // === Public Methods ===

    /// Adds, replaces, or for an empty value removes, the entity.
    pub fn store(&mut self, entity: DhtValueEntity) -> StoreResult {
        if entity.value().len() > self.settings.max_value_size {
            debug!(
                primary_key = ?entity.primary_key(),
                size = entity.value().len(),
                "Value too large"
            );
            return StoreResult::Rejected("value too large");
        }

        let primary_key = *entity.primary_key();
        let secondary_key = *entity.secondary_key();

        if !entity.is_local()
            && !entity.is_delete_request()
            && self.value_count >= self.settings.max_database_size
            && !self.contains(&primary_key, &secondary_key)
        {
            debug!(?primary_key, "Database is full");
            return StoreResult::Rejected("database full");
        }

        let max_values = self.settings.max_values_per_key;
        let bag = self
            .bags
            .entry(primary_key)
            .or_insert_with(|| DhtValueBag::new(primary_key));

        let result = match bag.store(entity, max_values) {
            BagStore::Added => {
                self.value_count += 1;
                StoreResult::Stored
            }
            BagStore::Replaced => StoreResult::Stored,
            BagStore::Removed => {
                self.value_count -= 1;
                StoreResult::Removed
            }
            BagStore::Rejected => StoreResult::Rejected("not replaceable"),
        };

        self.drop_if_empty(&primary_key);

        trace!(?primary_key, ?secondary_key, ?result, "Store");

        result
    }

    /// Same as [Self::store], for callers only interested in success.
    pub fn add(&mut self, entity: DhtValueEntity) -> bool {
        self.store(entity).is_success()
    }

    pub fn remove(&mut self, primary_key: &Kuid, secondary_key: &Kuid) -> Option<DhtValueEntity> {
        let removed = self
            .bags
            .get_mut(primary_key)
            .and_then(|bag| bag.remove(secondary_key));

        if removed.is_some() {
            self.value_count -= 1;
            self.drop_if_empty(primary_key);
        }

        removed
    }

    /// Records that a value was stored at `locations` nodes.
    pub fn update_published(
        &mut self,
        primary_key: &Kuid,
        secondary_key: &Kuid,
        locations: usize,
        now: Instant,
    ) -> bool {
        match self
            .bags
            .get_mut(primary_key)
            .and_then(|bag| bag.get_mut(secondary_key))
        {
            Some(entity) => {
                entity.set_published(locations, now);
                true
            }
            None => false,
        }
    }

    /// Removes every value matching the predicate, returning how many were removed.
    pub fn purge<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&DhtValueEntity) -> bool,
    {
        let mut removed = 0;

        for bag in self.bags.values_mut() {
            removed += bag.retain(|entity| !f(entity));
        }

        self.bags.retain(|_, bag| !bag.is_empty());
        self.value_count -= removed;

        removed
    }

    pub fn clear(&mut self) {
        self.bags.clear();
        self.value_count = 0;
    }

    // === Private Methods ===

    fn drop_if_empty(&mut self, primary_key: &Kuid) {
        if self.bags.get(primary_key).is_some_and(|bag| bag.is_empty()) {
            self.bags.remove(primary_key);
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new(DatabaseSettings::default())
    }
}

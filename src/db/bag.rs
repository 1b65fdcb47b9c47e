//! Values stored under one primary key, indexed by creator.

use std::collections::hash_map::{self, HashMap};

use tracing::trace;

use crate::common::Kuid;

use super::DhtValueEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagStore {
    /// A new secondary key.
    Added,
    /// An existing value was overwritten.
    Replaced,
    /// An existing value was deleted by an empty one.
    Removed,
    /// Refused by the replacement rules or the bag limit.
    Rejected,
}

impl BagStore {
    pub fn is_success(&self) -> bool {
        !matches!(self, BagStore::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct DhtValueBag {
    primary_key: Kuid,
    values: HashMap<Kuid, DhtValueEntity>,
}

impl DhtValueBag {
    pub fn new(primary_key: Kuid) -> Self {
        DhtValueBag {
            primary_key,
            values: HashMap::new(),
        }
    }

    // === Getters ===

    pub fn primary_key(&self) -> &Kuid {
        &self.primary_key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, secondary_key: &Kuid) -> Option<&DhtValueEntity> {
        self.values.get(secondary_key)
    }

    pub fn contains(&self, secondary_key: &Kuid) -> bool {
        self.values.contains_key(secondary_key)
    }

    pub fn values(&self) -> hash_map::Values<'_, Kuid, DhtValueEntity> {
        self.values.values()
    }

    // === Public Methods ===

    /// Adds, replaces or deletes the value for the entity's secondary key.
    ///
    /// New secondary keys are only accepted below `max_values`, unless local.
    pub fn store(&mut self, entity: DhtValueEntity, max_values: usize) -> BagStore {
        let secondary_key = *entity.secondary_key();

        if let Some(existing) = self.values.get(&secondary_key) {
            if !can_replace(existing, &entity) {
                trace!(
                    primary_key = ?self.primary_key,
                    ?secondary_key,
                    "Refusing to replace a value"
                );
                return BagStore::Rejected;
            }

            if entity.is_delete_request() {
                self.values.remove(&secondary_key);
                return BagStore::Removed;
            }

            let mut entity = entity;

            // Forwarded copies of an unchanged value only refresh the sender,
            // so the value still expires and is not forwarded again.
            if !entity.is_local() && !entity.is_direct() && existing.same_value(&entity) {
                entity.keep_times_of(existing);
            }

            self.values.insert(secondary_key, entity);
            return BagStore::Replaced;
        }

        // Nothing to delete
        if entity.is_delete_request() {
            return BagStore::Rejected;
        }

        if !entity.is_local() && self.values.len() >= max_values {
            trace!(primary_key = ?self.primary_key, "Value bag is full");
            return BagStore::Rejected;
        }

        self.values.insert(secondary_key, entity);
        BagStore::Added
    }

    pub fn remove(&mut self, secondary_key: &Kuid) -> Option<DhtValueEntity> {
        self.values.remove(secondary_key)
    }

    pub fn get_mut(&mut self, secondary_key: &Kuid) -> Option<&mut DhtValueEntity> {
        self.values.get_mut(secondary_key)
    }

    /// Keeps only the values matching the predicate, returning how many were removed.
    pub fn retain<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&DhtValueEntity) -> bool,
    {
        let before = self.values.len();
        self.values.retain(|_, entity| f(entity));
        before - self.values.len()
    }
}

/// Local values are only replaced by local values, and values received from
/// their creator are only replaced by the creator or the local node.
///
/// Deletes follow the same rules, and remote deletes must come from the creator.
pub fn can_replace(existing: &DhtValueEntity, incoming: &DhtValueEntity) -> bool {
    if incoming.is_local() {
        return true;
    }

    if existing.is_local() {
        return false;
    }

    if incoming.is_delete_request() && !incoming.is_direct() {
        return false;
    }

    !existing.is_direct() || incoming.is_direct()
}

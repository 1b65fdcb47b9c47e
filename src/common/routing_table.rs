//! Routing table interface consumed by the dispatcher and the value store,
//! and a simplified Kademlia routing table implementing it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::slice::Iter;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::common::{Contact, Kuid, KUID_BITS, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket, and the replication parameter.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// A routing table shared between the dispatcher thread and its collaborators.
pub type SharedRouteTable = Arc<RwLock<dyn RouteTable>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Every known contact.
    All,
    /// Only contacts that are neither stale nor failing.
    Alive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A range of the id space: every id sharing the first `depth` bits of `id`.
pub struct Bucket {
    pub id: Kuid,
    pub depth: usize,
}

impl Bucket {
    pub fn contains(&self, key: &Kuid) -> bool {
        key.truncate(self.depth) == self.id
    }
}

/// The narrow view of a routing table the DHT core needs.
pub trait RouteTable: Debug + Send + Sync {
    /// The contact of the local node.
    fn local_node(&self) -> &Contact;

    /// Sets the address of the local node, once its socket is bound.
    fn update_local_address(&mut self, address: SocketAddr);

    /// Returns up to `count` contacts closest to `key`, closest first,
    /// including the local node if it is among them.
    fn select(&self, key: &Kuid, count: usize, mode: SelectMode) -> Vec<Contact>;

    fn get(&self, node_id: &Kuid) -> Option<Contact>;

    /// Returns the bucket covering `key`.
    fn bucket(&self, key: &Kuid) -> Bucket;

    /// Attempts to add a contact, and return `true` if it did.
    fn add(&mut self, contact: Contact) -> bool;

    /// Refreshes the liveness of a known contact, returning `false` if it is unknown.
    fn touch(&mut self, node_id: &Kuid, round_trip_time: Option<Duration>) -> bool;

    /// Records a failed request to a known contact.
    fn handle_failure(&mut self, node_id: &Kuid);

    /// Number of remote contacts in this table.
    fn size(&self) -> usize;
}

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table, with buckets indexed by distance from the local node.
pub struct RoutingTable {
    local: Contact,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for the given local contact.
    pub fn new(local: Contact) -> Self {
        RoutingTable {
            local,
            buckets: BTreeMap::new(),
        }
    }

    /// Wraps this table to be shared across threads.
    pub fn shared(self) -> SharedRouteTable {
        Arc::new(RwLock::new(self))
    }

    /// Returns the [Kuid] of this node, where the distance is measured from.
    pub fn id(&self) -> &Kuid {
        self.local.node_id()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Returns an iterator over the contacts in this routing table.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Remove a contact from this routing table.
    pub fn remove(&mut self, node_id: &Kuid) {
        let distance = self.id().distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id)
        }
    }

    /// Depth of the bucket the local node falls in: one bit past the longest
    /// prefix shared with any known contact.
    fn local_depth(&self) -> usize {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(distance, _)| (MAX_DISTANCE - distance) as usize + 1)
            .max()
            .unwrap_or(0)
            .min(KUID_BITS)
    }
}

impl RouteTable for RoutingTable {
    fn local_node(&self) -> &Contact {
        &self.local
    }

    fn update_local_address(&mut self, address: SocketAddr) {
        self.local = Contact::new(*self.local.node_id(), address)
            .with_vendor(self.local.vendor(), self.local.version());
    }

    fn select(&self, key: &Kuid, count: usize, mode: SelectMode) -> Vec<Contact> {
        let mut candidates: Vec<&Contact> = self
            .contacts()
            .filter(|contact| mode == SelectMode::All || contact.is_alive())
            .chain(std::iter::once(&self.local))
            .collect();

        candidates.sort_by_key(|contact| contact.node_id().xor(key));
        candidates.into_iter().take(count).cloned().collect()
    }

    fn get(&self, node_id: &Kuid) -> Option<Contact> {
        if node_id == self.id() {
            return Some(self.local.clone());
        }

        let distance = self.id().distance(node_id);
        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.get(node_id))
            .cloned()
    }

    fn bucket(&self, key: &Kuid) -> Bucket {
        let local_depth = self.local_depth();
        let prefix = self.id().common_prefix_len(key);

        let depth = if prefix >= local_depth {
            local_depth
        } else {
            prefix + 1
        };

        Bucket {
            id: key.truncate(depth),
            depth,
        }
    }

    fn add(&mut self, contact: Contact) -> bool {
        let distance = self.id().distance(contact.node_id());

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        self.buckets.entry(distance).or_default().add(contact)
    }

    fn touch(&mut self, node_id: &Kuid, round_trip_time: Option<Duration>) -> bool {
        let distance = self.id().distance(node_id);

        match self.buckets.get_mut(&distance) {
            Some(bucket) => bucket.touch(node_id, round_trip_time),
            None => false,
        }
    }

    fn handle_failure(&mut self, node_id: &Kuid) {
        let distance = self.id().distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.handle_failure(node_id);
        }
    }

    fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.contacts.len())
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive contacts,
/// without dropping any responsive contacts in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Contacts in the k-bucket, sorted by the least recently seen.
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Contact) -> bool {
        if let Some(index) = self.position(incoming.node_id()) {
            // Same ip is trusted to be the same node, possibly on a new port.
            // Anything else is a collision and the existing contact wins.
            if self.contacts[index].same_ip(&incoming) {
                self.contacts.remove(index);
                self.contacts.push(incoming);

                true
            } else {
                false
            }
        } else if self.contacts.len() < MAX_BUCKET_SIZE_K {
            self.contacts.push(incoming);
            true
        } else if !self.contacts[0].is_alive() {
            // Remove the least recently seen contact and add the new one
            self.contacts.remove(0);
            self.contacts.push(incoming);

            true
        } else {
            false
        }
    }

    pub fn get(&self, node_id: &Kuid) -> Option<&Contact> {
        self.iter().find(|contact| contact.node_id() == node_id)
    }

    pub fn touch(&mut self, node_id: &Kuid, round_trip_time: Option<Duration>) -> bool {
        match self.position(node_id) {
            Some(index) => {
                let mut contact = self.contacts.remove(index);
                contact.touch();
                if let Some(rtt) = round_trip_time {
                    contact.set_round_trip_time(rtt);
                }
                self.contacts.push(contact);

                true
            }
            None => false,
        }
    }

    pub fn handle_failure(&mut self, node_id: &Kuid) {
        if let Some(index) = self.position(node_id) {
            self.contacts[index].record_failure();

            if self.contacts[index].is_dead() {
                self.contacts.remove(index);
            }
        }
    }

    pub fn remove(&mut self, node_id: &Kuid) {
        self.contacts.retain(|contact| contact.node_id() != node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    fn position(&self, node_id: &Kuid) -> Option<usize> {
        self.iter().position(|contact| contact.node_id() == node_id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

//! A stored value with its provenance and publishing state.

use std::time::Instant;

use crate::common::{Contact, DhtValue, Kuid, WireValue};

#[derive(Debug, Clone, PartialEq)]
/// One value stored under a (primary key, secondary key) pair.
///
/// The secondary key is always the node id of the creator.
pub struct DhtValueEntity {
    primary_key: Kuid,
    creator: Contact,
    sender: Contact,
    value: DhtValue,
    creation_time: Instant,
    last_publish_time: Option<Instant>,
    locations: usize,
    is_local: bool,
    is_direct: bool,
}

impl DhtValueEntity {
    /// A value created by the local node.
    pub fn local(local: Contact, primary_key: Kuid, value: DhtValue) -> Self {
        DhtValueEntity {
            primary_key,
            sender: local.clone(),
            creator: local,
            value,
            creation_time: Instant::now(),
            last_publish_time: None,
            locations: 0,
            is_local: true,
            is_direct: true,
        }
    }

    /// A value received from `sender`, who may have forwarded it for its creator.
    pub fn remote(creator: Contact, sender: Contact, primary_key: Kuid, value: DhtValue) -> Self {
        let is_direct = creator.node_id() == sender.node_id();

        DhtValueEntity {
            primary_key,
            creator,
            sender,
            value,
            creation_time: Instant::now(),
            last_publish_time: None,
            locations: 0,
            is_local: false,
            is_direct,
        }
    }

    pub fn from_wire(wire: WireValue, sender: Contact) -> Self {
        Self::remote(wire.creator, sender, wire.primary_key, wire.value)
    }

    pub fn to_wire(&self) -> WireValue {
        WireValue {
            creator: self.creator.clone(),
            primary_key: self.primary_key,
            value: self.value.clone(),
        }
    }

    // === Getters ===

    pub fn primary_key(&self) -> &Kuid {
        &self.primary_key
    }

    pub fn secondary_key(&self) -> &Kuid {
        self.creator.node_id()
    }

    pub fn creator(&self) -> &Contact {
        &self.creator
    }

    pub fn sender(&self) -> &Contact {
        &self.sender
    }

    pub fn value(&self) -> &DhtValue {
        &self.value
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn last_publish_time(&self) -> Option<Instant> {
        self.last_publish_time
    }

    /// Number of nodes this value was last stored at.
    pub fn locations(&self) -> usize {
        self.locations
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn has_been_published(&self) -> bool {
        self.last_publish_time.is_some()
    }

    /// Received from its creator rather than forwarded.
    pub fn is_direct(&self) -> bool {
        self.is_direct
    }

    /// Storing an empty value is a request to remove it.
    pub fn is_delete_request(&self) -> bool {
        self.value.is_empty()
    }

    /// Same key pair, value and creator address.
    pub fn same_value(&self, other: &Self) -> bool {
        self.primary_key == other.primary_key
            && self.creator == other.creator
            && self.value == other.value
    }

    // === Public Methods ===

    pub fn set_published(&mut self, locations: usize, now: Instant) {
        self.locations = locations;
        self.last_publish_time = Some(now);
    }

    /// Takes over the creation and publishing times of an earlier copy.
    pub(crate) fn keep_times_of(&mut self, previous: &DhtValueEntity) {
        self.creation_time = previous.creation_time;
        self.last_publish_time = previous.last_publish_time;
        self.locations = previous.locations;
    }

    /// Moves the creation time, for values restored from elsewhere.
    pub fn with_creation_time(mut self, creation_time: Instant) -> Self {
        self.creation_time = creation_time;
        self
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{ValueType, Version};

    #[test]
    fn remote_values_know_if_they_are_direct() {
        let creator = Contact::new(Kuid::random(), SocketAddr::from(([1, 1, 1, 1], 1)));
        let forwarder = Contact::new(Kuid::random(), SocketAddr::from(([2, 2, 2, 2], 1)));
        let value = DhtValue::new(ValueType::TEXT, Version::ZERO, "v");

        let direct =
            DhtValueEntity::remote(creator.clone(), creator.clone(), Kuid::random(), value.clone());
        let forwarded = DhtValueEntity::remote(creator.clone(), forwarder, Kuid::random(), value);

        assert!(direct.is_direct());
        assert!(!forwarded.is_direct());
        assert_eq!(forwarded.secondary_key(), creator.node_id());
        assert!(!forwarded.is_local());
    }

    #[test]
    fn wire_round_trip_keeps_creator() {
        let local = Contact::new(Kuid::random(), SocketAddr::from(([1, 1, 1, 1], 1)));
        let entity = DhtValueEntity::local(
            local.clone(),
            Kuid::sha1(b"key"),
            DhtValue::new(ValueType::TEXT, Version::ZERO, "v"),
        );

        let sender = Contact::new(Kuid::random(), SocketAddr::from(([3, 3, 3, 3], 1)));
        let received = DhtValueEntity::from_wire(entity.to_wire(), sender);

        assert!(received.same_value(&entity));
        assert!(!received.is_direct());
    }
}

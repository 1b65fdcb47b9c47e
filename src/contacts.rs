//! Admission rules for contacts learned from remote nodes.
//!
//! All functions are pure and safe to call from any thread.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info};

use crate::common::{Contact, Kuid};

/// Default fraction of a batch that must survive [scrub].
pub const DEFAULT_REQUIRED_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The outcome of [scrub].
pub struct Scrubbed {
    /// Contacts that passed every check.
    pub scrubbed: Vec<Contact>,
    /// Contacts claiming the local node id from another address.
    pub collisions: Vec<Contact>,
    /// `false` if too much of the batch was rejected to trust its sender.
    pub valid: bool,
}

/// A routable unicast address with a non zero port.
pub fn is_valid_socket_address(address: &SocketAddr) -> bool {
    if address.port() == 0 {
        return false;
    }

    match address.ip() {
        IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
        IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
    }
}

/// Private, loopback and link local addresses.
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7 (unique local)
                || (ip.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10 (link-local)
        }
    }
}

/// Returns `true` if `candidate`, as advertised by `sender`, may be added to the routing table.
///
/// A sender advertising itself with a private address is tolerated, it may not
/// know its public address. A third party advertised with one is rejected,
/// unless `allow_private` is set.
pub fn is_valid_contact(sender: &Contact, candidate: &Contact, allow_private: bool) -> bool {
    let address = candidate.address();

    if !is_valid_socket_address(&address) {
        debug!(node_id = ?candidate.node_id(), ?address, "Contact has an invalid address");
        return false;
    }

    if !allow_private && is_private_address(&address.ip()) {
        if candidate.node_id() == sender.node_id() {
            return true;
        }

        info!(
            sender = ?sender.node_id(),
            node_id = ?candidate.node_id(),
            ?address,
            "Sender advertised a contact with a private address"
        );
        return false;
    }

    true
}

/// The candidate claims the local node id from a different address.
pub fn is_collision(local: &Contact, candidate: &Contact) -> bool {
    local.node_id() == candidate.node_id() && local.address() != candidate.address()
}

/// The candidate is the local node itself.
pub fn is_local_contact(local: &Contact, candidate: &Contact) -> bool {
    local.node_id() == candidate.node_id() && local.address() == candidate.address()
}

/// Both addresses are of the same family.
pub fn is_same_address_space(a: &SocketAddr, b: &SocketAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Filters a batch of contacts received from `sender`.
///
/// Drops the local node, invalid contacts, contacts of another address family,
/// duplicates, and all but the first contact of each /24 network (the sender
/// is exempt). Contacts colliding with the local node id are set apart.
///
/// The batch is `valid` if at least `required_ratio` of it survived.
pub fn scrub(
    local: &Contact,
    sender: &Contact,
    contacts: &[Contact],
    required_ratio: f64,
    allow_private: bool,
) -> Scrubbed {
    let mut result = Scrubbed::default();

    let mut seen_ids: HashSet<Kuid> = HashSet::new();
    let mut networks: HashSet<[u8; 3]> = HashSet::new();

    for candidate in contacts {
        if is_local_contact(local, candidate) {
            continue;
        }

        if is_collision(local, candidate) {
            debug!(
                sender = ?sender.node_id(),
                address = ?candidate.address(),
                "Contact collides with the local node id"
            );
            result.collisions.push(candidate.clone());
            continue;
        }

        if !is_valid_contact(sender, candidate, allow_private) {
            continue;
        }

        if !is_same_address_space(&local.address(), &candidate.address()) {
            continue;
        }

        if !seen_ids.insert(*candidate.node_id()) {
            continue;
        }

        let is_sender = candidate.node_id() == sender.node_id();
        // Private networks are declustered only when they are not allowed as a whole.
        let exempt = is_sender || (allow_private && is_private_address(&candidate.address().ip()));

        if !exempt {
            if let Some(network) = candidate.class_c() {
                if !networks.insert(network) {
                    continue;
                }
            }
        }

        result.scrubbed.push(candidate.clone());
    }

    result.valid = contacts.is_empty()
        || result.scrubbed.len() as f64 / contacts.len() as f64 >= required_ratio;

    if !result.valid {
        debug!(
            sender = ?sender.node_id(),
            total = contacts.len(),
            survived = result.scrubbed.len(),
            "Rejecting contacts batch"
        );
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    fn contact(ip: [u8; 4], port: u16) -> Contact {
        Contact::new(Kuid::random(), SocketAddr::from((ip, port)))
    }

    fn local() -> Contact {
        contact([80, 1, 1, 1], 5000)
    }

    #[test]
    fn socket_addresses() {
        assert!(is_valid_socket_address(&SocketAddr::from(([1, 2, 3, 4], 1))));
        assert!(!is_valid_socket_address(&SocketAddr::from(([1, 2, 3, 4], 0))));
        assert!(!is_valid_socket_address(&SocketAddr::from(([0, 0, 0, 0], 1))));
        assert!(!is_valid_socket_address(&SocketAddr::from(([224, 0, 0, 1], 1))));
        assert!(!is_valid_socket_address(&SocketAddr::from(([255, 255, 255, 255], 1))));
    }

    #[test]
    fn private_addresses() {
        assert!(is_private_address(&IpAddr::from([10, 0, 0, 1])));
        assert!(is_private_address(&IpAddr::from([192, 168, 1, 1])));
        assert!(is_private_address(&IpAddr::from([127, 0, 0, 1])));
        assert!(is_private_address(&"fe80::1".parse().unwrap()));
        assert!(!is_private_address(&IpAddr::from([8, 8, 8, 8])));
        assert!(!is_private_address(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn private_sender_is_tolerated() {
        let sender = contact([192, 168, 0, 2], 5000);
        let third_party = contact([192, 168, 0, 3], 5000);

        assert!(is_valid_contact(&sender, &sender, false));
        assert!(!is_valid_contact(&sender, &third_party, false));
        assert!(is_valid_contact(&sender, &third_party, true));
    }

    #[test]
    fn collisions() {
        let local = local();
        let spoof = Contact::new(*local.node_id(), SocketAddr::from(([9, 9, 9, 9], 1)));
        let same = Contact::new(*local.node_id(), local.address());

        assert!(is_collision(&local, &spoof));
        assert!(!is_collision(&local, &same));
        assert!(is_local_contact(&local, &same));

        let sender = contact([9, 9, 9, 10], 1);
        let scrubbed = scrub(&local, &sender, &[spoof.clone(), same], 0.0, false);

        assert!(scrubbed.scrubbed.is_empty());
        assert_eq!(scrubbed.collisions, vec![spoof]);
    }

    #[test]
    fn one_contact_per_class_c() {
        let local = local();
        let sender = contact([20, 0, 0, 1], 1);

        let contacts = vec![
            sender.clone(),
            contact([20, 0, 0, 2], 1),
            contact([20, 0, 0, 3], 1),
            contact([20, 0, 1, 1], 1),
        ];

        let scrubbed = scrub(&local, &sender, &contacts, 0.5, false);

        assert_eq!(scrubbed.scrubbed.len(), 3);
        assert_eq!(scrubbed.scrubbed[0], sender);
        assert_eq!(scrubbed.scrubbed[1], contacts[1]);
        assert_eq!(scrubbed.scrubbed[2], contacts[3]);
        assert!(scrubbed.valid);
    }

    #[test]
    fn different_address_family_is_dropped() {
        let local = local();
        let sender = contact([20, 0, 0, 1], 1);
        let v6 = Contact::new(Kuid::random(), "[2001:db8::1]:80".parse().unwrap());

        let scrubbed = scrub(&local, &sender, &[v6], 0.0, false);
        assert!(scrubbed.scrubbed.is_empty());
    }

    fn batch(valid: usize) -> Vec<Contact> {
        (0..10)
            .map(|i| {
                let port = if i < valid { 4000 } else { 0 };
                contact([30, 0, i as u8, 1], port)
            })
            .collect()
    }

    #[test]
    fn scrub_ratio() {
        let local = local();
        let sender = contact([40, 0, 0, 1], 1);

        let half = scrub(&local, &sender, &batch(5), 0.5, false);
        assert_eq!(half.scrubbed.len(), 5);
        assert!(half.valid);

        let less = scrub(&local, &sender, &batch(4), 0.5, false);
        assert_eq!(less.scrubbed.len(), 4);
        assert!(!less.valid);

        assert!(scrub(&local, &sender, &[], 0.5, false).valid);
    }

    #[test]
    fn loopback_batch_when_private_allowed() {
        let local = contact([127, 0, 0, 1], 5000);
        let sender = contact([127, 0, 0, 1], 5001);
        let contacts: Vec<Contact> = (0..5).map(|i| contact([127, 0, 0, 1], 6000 + i)).collect();

        let scrubbed = scrub(&local, &sender, &contacts, 1.0, true);
        assert_eq!(scrubbed.scrubbed.len(), 5);
        assert!(scrubbed.valid);

        let scrubbed = scrub(&local, &sender, &contacts, 0.5, false);
        assert!(scrubbed.scrubbed.is_empty());
        assert!(!scrubbed.valid);
    }
}

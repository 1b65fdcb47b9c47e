//! Remote peer identity plus reachability and liveness metadata.
use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use crate::common::Kuid;

/// The age of a contact that has not been heard from, after which it is considered stale.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);
/// Consecutive failures after which a contact is considered dead.
pub const MAX_FAILURES: u8 = 3;

#[derive(Debug, Clone)]
/// A node in the DHT, as seen by the local node.
pub struct Contact {
    node_id: Kuid,
    address: SocketAddr,
    vendor: u32,
    version: u16,
    last_seen: Instant,
    failures: u8,
    round_trip_time: Option<Duration>,
}

impl Contact {
    /// Creates a contact that was just seen.
    pub fn new(node_id: Kuid, address: SocketAddr) -> Contact {
        Contact {
            node_id,
            address,
            vendor: 0,
            version: 0,
            last_seen: Instant::now(),
            failures: 0,
            round_trip_time: None,
        }
    }

    pub fn with_vendor(mut self, vendor: u32, version: u16) -> Self {
        self.vendor = vendor;
        self.version = version;
        self
    }

    /// Creates a contact with a random id and a loopback address, for tests.
    #[cfg(test)]
    pub fn random() -> Contact {
        use rand::Rng;

        let port: u16 = rand::thread_rng().gen_range(1024..u16::MAX);
        Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    // === Getters ===

    pub fn node_id(&self) -> &Kuid {
        &self.node_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn vendor(&self) -> u32 {
        self.vendor
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    // === Public Methods ===

    /// Node is last seen more than [STALE_TIME] ago.
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }

    pub fn is_dead(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn is_alive(&self) -> bool {
        !self.is_dead() && !self.is_stale()
    }

    /// Marks this contact as seen now, clearing its failures.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn set_round_trip_time(&mut self, rtt: Duration) {
        self.round_trip_time = Some(rtt);
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn same_ip(&self, other: &Self) -> bool {
        self.address.ip() == other.address.ip()
    }

    pub fn same_address(&self, address: &SocketAddr) -> bool {
        &self.address == address
    }

    /// Identity of the /24 network this contact lives in, `None` for IPv6.
    pub fn class_c(&self) -> Option<[u8; 3]> {
        match self.address.ip() {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                Some([octets[0], octets[1], octets[2]])
            }
            IpAddr::V6(_) => None,
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.address == other.address
    }
}

impl Eq for Contact {}

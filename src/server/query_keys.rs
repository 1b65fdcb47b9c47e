//! Query keys: short tokens proving a STORE sender recently received a
//! FIND_NODE response at the address it stores from.

use std::fmt::{self, Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use tracing::trace;

const SECRET_SIZE: usize = 20;
pub const QUERY_KEY_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Secrets rotate on this interval, a query key stays valid for up to twice as long.
pub const QUERY_KEY_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Query key generator, bound to the requester's ip and port.
pub struct QueryKeys {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
    rotate_interval: Duration,
}

impl Debug for QueryKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKeys (_)")
    }
}

impl QueryKeys {
    pub fn new() -> Self {
        Self::with_rotate_interval(QUERY_KEY_ROTATE_INTERVAL)
    }

    pub fn with_rotate_interval(rotate_interval: Duration) -> Self {
        let mut rng = thread_rng();

        QueryKeys {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            last_updated: Instant::now(),
            rotate_interval,
        }
    }

    // === Public Methods ===

    pub fn generate(&mut self, address: SocketAddr) -> [u8; QUERY_KEY_SIZE] {
        self.rotate_if_due();
        query_key(address, &self.curr_secret)
    }

    /// Accepts keys generated with the current or the previous secret.
    pub fn validate(&mut self, address: SocketAddr, key: &[u8]) -> bool {
        self.rotate_if_due();

        key == query_key(address, &self.curr_secret) || key == query_key(address, &self.prev_secret)
    }

    pub fn rotate(&mut self) {
        trace!("Rotating query key secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = thread_rng().gen();
        self.last_updated = Instant::now();
    }

    // === Private Methods ===

    fn rotate_if_due(&mut self) {
        if self.last_updated.elapsed() > self.rotate_interval {
            self.rotate();
        }
    }
}

impl Default for QueryKeys {
    fn default() -> Self {
        Self::new()
    }
}

fn query_key(address: SocketAddr, secret: &[u8; SECRET_SIZE]) -> [u8; QUERY_KEY_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match address.ip() {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(&address.port().to_be_bytes());
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

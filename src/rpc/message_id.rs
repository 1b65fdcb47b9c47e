//! Message ids that carry a checksum of their destination.
//!
//! A response echoes the id of the request it answers, so a response whose id
//! does not verify against its source address was never solicited by us.

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
};

use crate::common::{Kuid, KUID_SIZE};

const SECRET_SIZE: usize = 20;
const TAG_SIZE: usize = 4;
const NONCE_SIZE: usize = KUID_SIZE - TAG_SIZE;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Generates random message ids, tagged with the address they are sent to.
pub struct MessageIdFactory {
    secret: [u8; SECRET_SIZE],
}

impl Debug for MessageIdFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageIdFactory (_)")
    }
}

impl MessageIdFactory {
    pub fn new() -> Self {
        MessageIdFactory {
            secret: thread_rng().gen(),
        }
    }

    // === Public Methods ===

    /// Creates a fresh id for a message sent to `destination`.
    pub fn create(&self, destination: SocketAddr) -> Kuid {
        let mut bytes: [u8; KUID_SIZE] = thread_rng().gen();

        let tag = self.tag(&bytes[..NONCE_SIZE], destination);
        bytes[NONCE_SIZE..].copy_from_slice(&tag);

        Kuid(bytes)
    }

    /// Returns `true` if `id` was created by this factory for `source`.
    pub fn verify(&self, id: &Kuid, source: SocketAddr) -> bool {
        let bytes = id.as_bytes();
        self.tag(&bytes[..NONCE_SIZE], source) == bytes[NONCE_SIZE..]
    }

    // === Private Methods ===

    fn tag(&self, nonce: &[u8], address: SocketAddr) -> [u8; TAG_SIZE] {
        let mut digest = CASTAGNOLI.digest();

        match address.ip() {
            IpAddr::V4(v4) => digest.update(&v4.octets()),
            IpAddr::V6(v6) => digest.update(&v6.octets()),
        };

        digest.update(&address.port().to_be_bytes());
        digest.update(nonce);
        digest.update(&self.secret);

        digest.finalize().to_be_bytes()
    }
}

impl Default for MessageIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

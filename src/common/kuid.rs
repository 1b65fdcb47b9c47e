//! Kademlia unique identifier, used both for node ids and value keys.
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of a [Kuid] in bytes.
pub const KUID_SIZE: usize = 20;
/// The size of a [Kuid] in bits.
pub const KUID_BITS: usize = KUID_SIZE * 8;
pub const MAX_DISTANCE: u8 = KUID_BITS as u8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// 160 bit Kademlia identifier.
///
/// Bits are numbered from the most significant bit of the first byte, so
/// bit `0` is the first bit of the id. Every operation returns a new value.
pub struct Kuid(pub [u8; KUID_SIZE]);

impl Kuid {
    /// All bits unset.
    pub const MIN: Kuid = Kuid([0; KUID_SIZE]);
    /// All bits set.
    pub const MAX: Kuid = Kuid([0xff; KUID_SIZE]);

    pub fn random() -> Kuid {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; KUID_SIZE] = rng.gen();

        Kuid(random_bytes)
    }

    /// Create a new Kuid from some bytes. Returns Err if `bytes` is not of length
    /// [KUID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Kuid> {
        let bytes = bytes.as_ref();
        if bytes.len() != KUID_SIZE {
            return Err(Error::InvalidKuidSize(bytes.len()));
        }

        let mut tmp: [u8; KUID_SIZE] = [0; KUID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Kuid(tmp))
    }

    /// Derive a key from arbitrary content using SHA-1.
    pub fn sha1(data: &[u8]) -> Kuid {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data);

        Kuid(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KUID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Bitwise XOR of two ids, the Kademlia distance metric.
    pub fn xor(&self, other: &Kuid) -> Kuid {
        let mut out = [0u8; KUID_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Kuid(out)
    }

    /// Simplified XOR distance between this Kuid and a target Kuid.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Kuid is 160
    /// Distance to a Kuid with 5 leading matching bits is 155
    pub fn distance(&self, other: &Kuid) -> u8 {
        MAX_DISTANCE - self.common_prefix_len(other) as u8
    }

    /// Number of leading bits shared with `other`.
    pub fn common_prefix_len(&self, other: &Kuid) -> usize {
        for i in 0..KUID_SIZE {
            let diff = self.0[i] ^ other.0[i];
            if diff != 0 {
                return i * 8 + diff.leading_zeros() as usize;
            }
        }

        KUID_BITS
    }

    /// Returns `true` if `a` is closer to `self` than `b` by XOR distance.
    pub fn is_closer(&self, a: &Kuid, b: &Kuid) -> bool {
        self.xor(a) < self.xor(b)
    }

    pub fn is_bit_set(&self, bit: usize) -> bool {
        if bit >= KUID_BITS {
            return false;
        }

        self.0[bit / 8] & mask(bit) != 0
    }

    pub fn set_bit(&self, bit: usize) -> Kuid {
        self.with_bit(bit, |byte, mask| byte | mask)
    }

    pub fn unset_bit(&self, bit: usize) -> Kuid {
        self.with_bit(bit, |byte, mask| byte & !mask)
    }

    pub fn flip_bit(&self, bit: usize) -> Kuid {
        self.with_bit(bit, |byte, mask| byte ^ mask)
    }

    /// Position of the lowest set bit, counted from the least significant bit
    /// of the last byte. `None` if no bit is set.
    pub fn lowest_set_bit(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate().rev() {
            if *byte != 0 {
                return Some((KUID_SIZE - 1 - i) * 8 + byte.trailing_zeros() as usize);
            }
        }

        None
    }

    /// Keeps the first `depth` bits and clears the rest.
    pub fn truncate(&self, depth: usize) -> Kuid {
        if depth >= KUID_BITS {
            return *self;
        }

        let mut out = [0u8; KUID_SIZE];
        let full = depth / 8;
        out[..full].copy_from_slice(&self.0[..full]);

        let rest = depth % 8;
        if rest > 0 {
            out[full] = self.0[full] & (0xff << (8 - rest));
        }

        Kuid(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    // === Private Methods ===

    fn with_bit(&self, bit: usize, op: impl Fn(u8, u8) -> u8) -> Kuid {
        if bit >= KUID_BITS {
            return *self;
        }

        let mut out = self.0;
        out[bit / 8] = op(out[bit / 8], mask(bit));

        Kuid(out)
    }
}

fn mask(bit: usize) -> u8 {
    0x80 >> (bit % 8)
}

impl Display for Kuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Kuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({})", self)
    }
}

impl FromStr for Kuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Kuid> {
        if s.len() % 2 != 0 {
            return Err(Error::InvalidKuidEncoding(s.to_string()));
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidKuidEncoding(s.to_string()))?;

        Kuid::from_bytes(bytes)
    }
}

impl From<[u8; KUID_SIZE]> for Kuid {
    fn from(bytes: [u8; KUID_SIZE]) -> Self {
        Kuid(bytes)
    }
}

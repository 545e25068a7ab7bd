use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::ops::BitXor;

use itertools::izip;
use rand::rngs::{OsRng, SmallRng};
use rand::{RngCore, SeedableRng};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::consts::{ID_LEN, ID_LEN_BITS};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdError {
    #[error("invalid id length: {0} bytes, expected 20")]
    InvalidLength(usize),
    #[error("invalid hex id: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("prefix of {0} bits leaves no free bit")]
    PrefixTooLong(usize),
}

/// 160-bit node/key identifier, compared by XOR distance.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    /// Fresh identifier from the OS entropy source.
    pub fn generate() -> Id {
        let mut buf = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut buf);
        Id(buf)
    }

    /// Fast non-cryptographic identifier, only fit for refresh probes.
    pub fn generate_weak() -> Id {
        let mut buf = [0u8; ID_LEN];
        SmallRng::from_entropy().fill_bytes(&mut buf);
        Id(buf)
    }

    pub fn from_key(key: &[u8]) -> Id {
        Id(Sha1::digest(key).into())
    }

    /// Decodes up to 40 hex digits; shorter input is left-padded with zeros.
    pub fn from_hex(s: &str) -> Result<Id, IdError> {
        let raw = hex::decode(s)?;
        if raw.len() > ID_LEN {
            return Err(IdError::InvalidLength(raw.len()));
        }
        let mut buf = [0u8; ID_LEN];
        buf[ID_LEN - raw.len()..].copy_from_slice(&raw);
        Ok(Id(buf))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_short_hex(&self) -> String {
        let hex_id = hex::encode(self.0);
        let trimmed = hex_id.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_owned()
        } else {
            trimmed.to_owned()
        }
    }

    /// Bit at `index`, where bit 0 is the most significant bit of byte 0.
    pub fn at(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - (index & 7))) & 1 == 1
    }

    pub fn distance(&self, other: &Id) -> Id {
        *self ^ *other
    }

    /// Orders `a` and `b` by their XOR distance from `self`.
    ///
    /// `Less` means `a` is closer. Antisymmetric: swapping `a` and `b`
    /// reverses the result, and equal distances compare `Equal`.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        for (s, xa, xb) in izip!(&self.0, &a.0, &b.0) {
            let da = s ^ xa;
            let db = s ^ xb;
            if da != db {
                return da.cmp(&db);
            }
        }
        Ordering::Equal
    }

    /// Overwrites the first `prefix.len()` bits with the prefix.
    ///
    /// Errors when the prefix spans the whole identifier, since a fully
    /// pinned id defeats randomized generation.
    pub fn set_prefix(&mut self, prefix: &Prefix) -> Result<(), IdError> {
        if prefix.len() >= ID_LEN_BITS {
            return Err(IdError::PrefixTooLong(prefix.len()));
        }
        self.apply_prefix(prefix);
        Ok(())
    }

    pub(crate) fn apply_prefix(&mut self, prefix: &Prefix) {
        let full = prefix.len() / 8;
        self.0[..full].copy_from_slice(&prefix.raw[..full]);
        let rem = prefix.len() & 7;
        if rem != 0 {
            let mask = 0xffu8 << (8 - rem);
            self.0[full] = (prefix.raw[full] & mask) | (self.0[full] & !mask);
        }
    }
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a ^ b;
        }
        res
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Id").field(&self.as_short_hex()).finish()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Id::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A bitstring of at most 160 bits, the address of one routing-tree region.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Prefix {
    raw: [u8; ID_LEN],
    len: usize,
}

impl Prefix {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, index: usize) -> bool {
        (self.raw[index / 8] >> (7 - (index & 7))) & 1 == 1
    }

    /// The prefix extended by one bit.
    pub fn child(&self, bit: bool) -> Prefix {
        let mut next = self.clone();
        let mask = 1u8 << (7 - (self.len & 7));
        if bit {
            next.raw[self.len / 8] |= mask;
        } else {
            next.raw[self.len / 8] &= !mask;
        }
        next.len += 1;
        next
    }

    /// Whether the first `len` bits of `id` equal this prefix.
    pub fn matches(&self, id: &Id) -> bool {
        let full = self.len / 8;
        if self.raw[..full] != id.0[..full] {
            return false;
        }
        let rem = self.len & 7;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (self.raw[full] ^ id.0[full]) & mask == 0
    }
}

impl Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bits = String::with_capacity(self.len);
        for i in 0..self.len {
            bits.push(if self.bit(i) { '1' } else { '0' });
        }
        f.debug_tuple("Prefix").field(&bits).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_laws() {
        let a = Id::generate();
        let b = Id::generate();
        assert_eq!(a ^ b, b ^ a);
        assert_eq!(a ^ a, Id::ZERO);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), Id::ZERO);
    }

    #[test]
    fn cmp_distance_antisymmetric() {
        let x = Id::generate();
        let a = Id::generate();
        let b = Id::generate();
        assert_eq!(x.cmp_distance(&a, &b), x.cmp_distance(&b, &a).reverse());
        assert_eq!(x.cmp_distance(&a, &a), Ordering::Equal);
    }

    #[test]
    fn bit_order_is_msb_first() {
        let id = Id::from_hex("8000000000000000000000000000000000000000").unwrap();
        assert!(id.at(0));
        for i in 1..ID_LEN_BITS {
            assert!(!id.at(i));
        }
        let id = Id::from_hex("0000000000000000000000000000000000000001").unwrap();
        assert!(id.at(ID_LEN_BITS - 1));
        assert!(!id.at(0));
    }

    #[test]
    fn from_key_is_sha1() {
        let id = Id::from_key(b"abc");
        assert_eq!(id.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::generate();
        assert_eq!(Id::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn short_hex_is_left_padded() {
        let id = Id::from_hex("aa").unwrap();
        assert_eq!(id.0[ID_LEN - 1], 0xaa);
        assert_eq!(id.as_short_hex(), "aa");
        assert_eq!(Id::ZERO.as_short_hex(), "0");
    }

    #[test]
    fn generate_is_not_constant() {
        assert_ne!(Id::generate(), Id::generate());
        assert_ne!(Id::generate_weak(), Id::generate_weak());
    }

    #[test]
    fn prefix_child_and_match() {
        let p = Prefix::default().child(true).child(false).child(true);
        assert_eq!(p.len(), 3);
        assert!(p.bit(0));
        assert!(!p.bit(1));
        assert!(p.bit(2));

        // 0b1010_0000 = 0xa0
        let matching = Id::from_hex("a000000000000000000000000000000000000001").unwrap();
        let other = Id::from_hex("e000000000000000000000000000000000000001").unwrap();
        assert!(p.matches(&matching));
        assert!(!p.matches(&other));
        assert!(Prefix::default().matches(&other));
    }

    #[test]
    fn set_prefix_pins_leading_bits() {
        let p = Prefix::default().child(true).child(true);
        let mut id = Id::ZERO;
        id.set_prefix(&p).unwrap();
        assert!(id.at(0));
        assert!(id.at(1));
        assert!(!id.at(2));
    }

    #[test]
    fn set_prefix_rejects_full_width() {
        let mut p = Prefix::default();
        for _ in 0..ID_LEN_BITS {
            p = p.child(false);
        }
        let mut id = Id::generate();
        assert_eq!(id.set_prefix(&p), Err(IdError::PrefixTooLong(ID_LEN_BITS)));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_round_trip() {
        let id = Id::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<Id>(&json).unwrap(), id);
    }
}

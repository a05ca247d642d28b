//! Kademlia node Id or a lookup target
use rand::Rng;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The largest possible [NodeId::log_distance].
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct NodeId([u8; ID_SIZE]);

impl NodeId {
    pub fn random() -> NodeId {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        NodeId(random_bytes)
    }

    /// Derive an Id deterministically from a seed, for example the `host:port`
    /// of a well known entry point.
    pub fn from_seed<T: AsRef<[u8]>>(seed: T) -> NodeId {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(seed.as_ref());

        NodeId(hasher.digest().bytes())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<NodeId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(NodeId(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// XOR distance between this Id and another, as an unsigned big-endian integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut xor = [0; ID_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(xor)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn log_distance(&self, other: &NodeId) -> u8 {
        MAX_DISTANCE - self.distance(other).leading_zeros()
    }
}

/// Returns `true` if `candidate` is strictly closer to `reference` than `local` is.
pub fn is_closer(candidate: &NodeId, reference: &NodeId, local: &NodeId) -> bool {
    candidate.distance(reference) < local.distance(reference)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// XOR of two [NodeId]s. Ordering is numeric, smaller is closer.
pub struct Distance([u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_SIZE]);

    pub fn is_zero(&self) -> bool {
        self == &Distance::ZERO
    }

    pub fn leading_zeros(&self) -> u8 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return (i as u32 * 8 + byte.leading_zeros()) as u8;
            }
        }

        MAX_DISTANCE
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", NodeId(self.0))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<NodeId> {
        if !s.is_ascii() || s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(NodeId(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<NodeId, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;

        NodeId::from_bytes(bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = NodeId::random();
        assert!(id.distance(&id).is_zero());
        assert_eq!(id.log_distance(&id), 0);
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..100 {
            let a = NodeId::random();
            let b = NodeId::random();

            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.log_distance(&b), b.log_distance(&a));
        }
    }

    #[test]
    fn distance_to_furthest() {
        let id = NodeId::random();

        let mut opposite = [0_u8; ID_SIZE];
        for (i, byte) in opposite.iter_mut().enumerate() {
            *byte = id.as_bytes()[i] ^ 0xff;
        }

        assert_eq!(id.log_distance(&NodeId(opposite)), MAX_DISTANCE);
    }

    #[test]
    fn distance_is_numeric() {
        let zero = NodeId([0; ID_SIZE]);

        let mut near = [0; ID_SIZE];
        near[ID_SIZE - 1] = 0xff;

        let mut far = [0; ID_SIZE];
        far[0] = 0x01;

        assert!(zero.distance(&NodeId(near)) < zero.distance(&NodeId(far)));
        assert_eq!(zero.log_distance(&NodeId(near)), 8);
        assert_eq!(zero.log_distance(&NodeId(far)), 153);
    }

    #[test]
    fn closer() {
        let target = NodeId([0; ID_SIZE]);

        let mut a = [0; ID_SIZE];
        a[0] = 0x10;
        let mut b = [0; ID_SIZE];
        b[0] = 0x20;

        assert!(is_closer(&NodeId(a), &target, &NodeId(b)));
        assert!(!is_closer(&NodeId(b), &target, &NodeId(a)));
        assert!(!is_closer(&NodeId(a), &target, &NodeId(a)));
    }

    #[test]
    fn from_seed_is_deterministic() {
        assert_eq!(
            NodeId::from_seed("127.0.0.1:7000"),
            NodeId::from_seed("127.0.0.1:7000")
        );
        assert_ne!(
            NodeId::from_seed("127.0.0.1:7000"),
            NodeId::from_seed("127.0.0.1:7001")
        );
    }

    #[test]
    fn hex_display_and_parse() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_string().parse().unwrap();

        assert_eq!(parsed, id);
        assert!(NodeId::from_str("zz").is_err());
        assert!(NodeId::from_str(&"é".repeat(20)).is_err());
    }

    #[test]
    fn invalid_size() {
        assert!(matches!(
            NodeId::from_bytes([0; 4]),
            Err(Error::InvalidIdSize(4))
        ));
    }
}

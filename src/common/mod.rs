mod closest_peers;
mod id;
mod messages;
mod peer;
mod routing_table;

pub use closest_peers::*;
pub use id::*;
pub use messages::*;
pub use peer::*;
pub use routing_table::*;

/// Time since the unix epoch in milliseconds.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

/// Bencode has no booleans, so they travel as integers.
pub(crate) mod bool_int {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(i64::deserialize(deserializer)? != 0)
    }
}

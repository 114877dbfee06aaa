use crate::core::{ActorKey, IndexError, Result, SiloId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

pub const QUEUE_KEY_SEPARATOR: char = '-';
const QUEUE_STORAGE_PREFIX: &str = "workflow-queue";

/// Identity of a workflow queue within a silo: the indexed interface it serves
/// and its partition number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    interface: String,
    sequence: u32,
}

impl QueueId {
    pub fn new(interface: impl Into<String>, sequence: u32) -> Self {
        Self {
            interface: interface.into(),
            sequence,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The queue of `interface` that `actor`'s records go to.
    pub fn for_actor(interface: &str, actor: &ActorKey, partitions: u32) -> Self {
        Self::new(interface, partition_for(interface, actor, partitions))
    }

    /// `"{interface}-{sequence}"`
    pub fn key(&self) -> String {
        format!("{}{}{}", self.interface, QUEUE_KEY_SEPARATOR, self.sequence)
    }

    /// Parses a queue key back into its interface name and partition number.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::MalformedQueueKey` unless the key has exactly one
    /// separator, a non-empty interface name and a numeric partition.
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || IndexError::MalformedQueueKey(key.to_string());
        let mut parts = key.split(QUEUE_KEY_SEPARATOR);
        let (Some(interface), Some(sequence), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if interface.is_empty() {
            return Err(malformed());
        }
        let sequence = sequence.parse::<u32>().map_err(|_| malformed())?;
        Ok(Self::new(interface, sequence))
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A queue identity scoped to the silo that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueAddress {
    pub silo: SiloId,
    pub queue: QueueId,
}

impl QueueAddress {
    pub fn new(silo: SiloId, queue: QueueId) -> Self {
        Self { silo, queue }
    }

    /// Store key of the queue's durable state.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}",
            QUEUE_STORAGE_PREFIX,
            self.silo,
            self.queue.key()
        )
    }

    /// Inverse of `storage_key`.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::MalformedQueueKey` when the key is not a queue
    /// state key or its queue part does not parse.
    pub fn from_storage_key(key: &str) -> Result<Self> {
        let malformed = || IndexError::MalformedQueueKey(key.to_string());
        let rest = key
            .strip_prefix(QUEUE_STORAGE_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;
        let (silo, queue_key) = rest.split_once('/').ok_or_else(malformed)?;
        if silo.is_empty() {
            return Err(malformed());
        }
        let queue = QueueId::parse(queue_key)?;
        Ok(Self::new(SiloId::new(silo), queue))
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.queue, self.silo)
    }
}

/// FNV-1a with the standard offset basis. `DefaultHasher` is keyed per
/// process, so partitions computed with it would differ between silos.
struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for Fnv1a {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Partition of `actor` among the `partitions` queues of `interface`.
///
/// The interface name is part of the hash so one actor's interfaces spread
/// over different partitions. A `0xff` byte, which never occurs in UTF-8,
/// separates it from the actor key.
pub fn partition_for(interface: &str, actor: &ActorKey, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    let mut hasher = Fnv1a::default();
    hasher.write(interface.as_bytes());
    hasher.write_u8(0xff);
    hasher.write(actor.as_str().as_bytes());
    (hasher.finish() % u64::from(partitions)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_parses_back() {
        let id = QueueId::new("IPlayer", 3);
        assert_eq!(id.key(), "IPlayer-3");
        assert_eq!(QueueId::parse("IPlayer-3").unwrap(), id);
    }

    #[test]
    fn malformed_queue_keys_are_rejected() {
        for key in ["IPlayer", "I-Player-3", "-3", "IPlayer-x", "IPlayer-"] {
            assert!(
                matches!(QueueId::parse(key), Err(IndexError::MalformedQueueKey(_))),
                "{} should be rejected",
                key
            );
        }
    }

    #[test]
    fn storage_key_round_trips() {
        let address = QueueAddress::new(SiloId::new("silo-a"), QueueId::new("IPlayer", 1));
        let key = address.storage_key();
        assert_eq!(key, "workflow-queue/silo-a/IPlayer-1");
        assert_eq!(QueueAddress::from_storage_key(&key).unwrap(), address);
        assert!(QueueAddress::from_storage_key("index-bucket/by_name/0").is_err());
    }

    #[test]
    fn partitions_are_stable_and_bounded() {
        let actor = ActorKey::new("player-42");
        let first = partition_for("IPlayer", &actor, 8);
        assert_eq!(first, partition_for("IPlayer", &actor, 8));
        assert!(first < 8);
        assert_eq!(partition_for("IPlayer", &actor, 0), 0);
        assert_eq!(
            QueueId::for_actor("IPlayer", &actor, 8),
            QueueId::new("IPlayer", first)
        );
    }

    #[test]
    fn interface_and_key_boundary_matters() {
        let mut joined = Fnv1a::default();
        joined.write(b"IPlayerp1");
        let mut split = Fnv1a::default();
        split.write(b"IPlayer");
        split.write_u8(0xff);
        split.write(b"p1");
        assert_ne!(joined.finish(), split.finish());
    }
}

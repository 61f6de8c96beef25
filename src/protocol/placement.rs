//! Shard placement functions: which server owns a key, and the replica ring
//! neighborhood around each shard.
//!
//! All three functions are pure and total; routing decisions anywhere in the
//! cluster must go through them rather than through stored cross-references.

/// Fixed width of every key, in bytes.
pub const KEY_SIZE: usize = 16;

/// Fixed-width opaque key type.
pub type Key = [u8; KEY_SIZE];

/// Server/shard ID type.
pub type ServerId = u8;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

// FNV-1a over the key bytes. Placement must agree across processes, so the
// std randomized hasher cannot be used here.
fn fnv1a(key: &Key) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The shard that owns this key as primary.
pub fn key_owner(key: &Key, population: u8) -> ServerId {
    debug_assert!(population > 0);
    (fnv1a(key) % population as u64) as ServerId
}

/// The shard holding the secondary copy of shard `id`'s primary set.
pub fn secondary_of(id: ServerId, population: u8) -> ServerId {
    ((id as u16 + 1) % population as u16) as ServerId
}

/// The shard whose primary set is replicated in shard `id`'s secondary set.
pub fn primary_of(id: ServerId, population: u8) -> ServerId {
    ((id as u16 + population as u16 - 1) % population as u16) as ServerId
}

/// Builds a fixed-width key from arbitrary bytes, zero-padding short input
/// and truncating long input.
pub fn key_from_bytes(bytes: &[u8]) -> Key {
    let mut key = [0u8; KEY_SIZE];
    let len = bytes.len().min(KEY_SIZE);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}

/// Hex rendering of a key for log messages.
pub fn key_to_hex(key: &Key) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod placement_tests {
    use super::*;

    #[test]
    fn owner_in_range() {
        for population in 3..=7u8 {
            for seed in 0..100u8 {
                let key = key_from_bytes(&[seed, seed.wrapping_mul(17)]);
                assert!(key_owner(&key, population) < population);
            }
        }
    }

    #[test]
    fn owner_is_pure() {
        let key = key_from_bytes(b"deterministic");
        let first = key_owner(&key, 5);
        for _ in 0..10 {
            assert_eq!(key_owner(&key, 5), first);
        }
    }

    #[test]
    fn ring_neighbors_inverse() {
        for population in 3..=7u8 {
            for id in 0..population {
                assert_eq!(
                    primary_of(secondary_of(id, population), population),
                    id
                );
                assert_eq!(
                    secondary_of(primary_of(id, population), population),
                    id
                );
                assert_ne!(secondary_of(id, population), id);
            }
        }
    }

    #[test]
    fn ring_wraps_around() {
        assert_eq!(secondary_of(2, 3), 0);
        assert_eq!(primary_of(0, 3), 2);
    }

    #[test]
    fn key_padding_and_truncation() {
        let short = key_from_bytes(b"ab");
        assert_eq!(&short[..2], b"ab");
        assert!(short[2..].iter().all(|&b| b == 0));

        let long = key_from_bytes(b"0123456789abcdefXYZ");
        assert_eq!(&long[..], b"0123456789abcdef");
    }

    #[test]
    fn hex_rendering() {
        let key = key_from_bytes(&[0x00, 0xff]);
        assert!(key_to_hex(&key).starts_with("00ff"));
        assert_eq!(key_to_hex(&key).len(), 2 * KEY_SIZE);
    }
}

//! In-RAM hash index over the unsorted bases.
//!
//! Maps a key to the base and index-file slot of its live record.
//! Buckets are sharded, each shard behind its own mutex. With the
//! `L2HASH` backend flag the shard maps are keyed by a derived 64-bit
//! hash and collisions resolve through a full key compare, which
//! keeps the maps small for the common 64-byte keys.
//!
//! Sorted bases are intentionally absent here: they are searched
//! through their sorted index sidecar (bloom filter + block index)
//! instead, so a restart does not have to pull every base into RAM.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

use siphasher::sip::SipHasher24;

use crate::store::disk_control::Key;

const SHARD_COUNT: usize = 64;

// Fixed hash keys: the L2 hash must be stable across restarts since
// the bloom sidecars on disk are derived from it.
const L2_KEY_0: u64 = 0x6862_6c6f_7374_6f72;
const L2_KEY_1: u64 = 0x6532_6861_7368_2e76;

/// Deterministic 64-bit secondary hash of a record key.
pub fn l2_hash(key: &Key) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(L2_KEY_0, L2_KEY_1);
    hasher.write(&key.0);
    hasher.finish()
}

/// Location of a live record within an unsorted base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamControl {
    /// Number of the owning base.
    pub base_num: u64,
    /// Offset of the record's slot in the base's index file.
    pub index_offset: u64,
}

enum Shard {
    Plain(HashMap<Key, RamControl>),
    L2(HashMap<u64, Vec<(Key, RamControl)>>),
}

impl Shard {
    fn insert(&mut self, key: Key, l2: u64, ctl: RamControl) -> Option<RamControl> {
        match self {
            Shard::Plain(map) => map.insert(key, ctl),
            Shard::L2(map) => {
                let bucket = map.entry(l2).or_insert_with(Vec::new);
                for entry in bucket.iter_mut() {
                    if entry.0 == key {
                        return Some(std::mem::replace(&mut entry.1, ctl));
                    }
                }
                bucket.push((key, ctl));
                None
            }
        }
    }

    fn get(&self, key: &Key, l2: u64) -> Option<RamControl> {
        match self {
            Shard::Plain(map) => map.get(key).copied(),
            Shard::L2(map) => map
                .get(&l2)?
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, ctl)| *ctl),
        }
    }

    fn remove(&mut self, key: &Key, l2: u64) -> Option<RamControl> {
        match self {
            Shard::Plain(map) => map.remove(key),
            Shard::L2(map) => {
                let bucket = map.get_mut(&l2)?;
                let pos = bucket.iter().position(|(k, _)| k == key)?;
                let (_, ctl) = bucket.swap_remove(pos);
                if bucket.is_empty() {
                    map.remove(&l2);
                }
                Some(ctl)
            }
        }
    }

    fn remove_base(&mut self, base_num: u64) {
        match self {
            Shard::Plain(map) => map.retain(|_, ctl| ctl.base_num != base_num),
            Shard::L2(map) => {
                map.retain(|_, bucket| {
                    bucket.retain(|(_, ctl)| ctl.base_num != base_num);
                    !bucket.is_empty()
                });
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Shard::Plain(map) => map.len(),
            Shard::L2(map) => map.values().map(|b| b.len()).sum(),
        }
    }
}

pub struct HashIndex {
    shards: Vec<Mutex<Shard>>,
}

impl HashIndex {
    pub fn new(use_l2: bool) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new(if use_l2 {
                    Shard::L2(HashMap::new())
                } else {
                    Shard::Plain(HashMap::new())
                })
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, l2: u64) -> &Mutex<Shard> {
        &self.shards[(l2 % SHARD_COUNT as u64) as usize]
    }

    /// Insert or replace the mapping for `key`, returning the old one.
    pub fn insert(&self, key: Key, ctl: RamControl) -> Option<RamControl> {
        let l2 = l2_hash(&key);
        self.shard(l2).lock().unwrap().insert(key, l2, ctl)
    }

    pub fn get(&self, key: &Key) -> Option<RamControl> {
        let l2 = l2_hash(key);
        self.shard(l2).lock().unwrap().get(key, l2)
    }

    pub fn remove(&self, key: &Key) -> Option<RamControl> {
        let l2 = l2_hash(key);
        self.shard(l2).lock().unwrap().remove(key, l2)
    }

    /// Drop every entry pointing at `base_num`. Used when a base is
    /// consumed by datasort or its index gets sorted.
    pub fn remove_base(&self, base_num: u64) {
        for shard in &self.shards {
            shard.lock().unwrap().remove_base(base_num);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

// Stable hash used for directory placement. `DefaultHasher::new()` is
// keyed with fixed constants, so slot indices are reproducible across
// runs and across table instances.
pub(crate) fn stable_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn low_bits(value: u64, n: usize) -> u64 {
    value & ((1u64 << n) - 1)
}

struct Bucket<K, V> {
    depth: usize,
    capacity: usize,
    items: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(capacity: usize, depth: usize) -> Self {
        Bucket {
            depth,
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> bool {
        let before = self.items.len();
        self.items.retain(|(k, _)| k != key);
        self.items.len() != before
    }

    // Upserts in place; returns false when the key is new and the bucket
    // has no room for it.
    fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(slot) = self.items.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.items.push((key, value));
        true
    }
}

struct Directory<K, V> {
    global_depth: usize,
    num_buckets: usize,
    // 2^global_depth slots. Several slots may point at the same bucket;
    // buckets never point back at the directory, so no ownership cycles.
    slots: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

/// In-memory extendible hash table mapping page ids to frame slots (and any
/// other small key/value pairs a cache-sized workload needs). The directory
/// doubles on overflow of a maximally-deep bucket; all other overflows split
/// a single bucket without touching the rest of the table.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    state: Mutex<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size >= 1, "bucket_size must be at least 1");
        let first = Arc::new(Mutex::new(Bucket::new(bucket_size, 0)));

        ExtendibleHashTable {
            bucket_size,
            state: Mutex::new(Directory {
                global_depth: 0,
                num_buckets: 1,
                slots: vec![first],
            }),
        }
    }

    pub fn global_depth(&self) -> usize {
        self.state.lock().unwrap().global_depth
    }

    pub fn local_depth(&self, slot_index: usize) -> usize {
        let state = self.state.lock().unwrap();
        let depth = state.slots[slot_index].lock().unwrap().depth;
        depth
    }

    pub fn num_buckets(&self) -> usize {
        self.state.lock().unwrap().num_buckets
    }

    // Counts the distinct buckets reachable through the directory; must
    // always agree with `num_buckets`.
    #[cfg(test)]
    pub(crate) fn distinct_buckets(&self) -> usize {
        let state = self.state.lock().unwrap();
        let mut identities: Vec<_> = state.slots.iter().map(Arc::as_ptr).collect();
        identities.sort_unstable();
        identities.dedup();
        identities.len()
    }

    fn index_of(state: &Directory<K, V>, key: &K) -> usize {
        low_bits(stable_hash(key), state.global_depth) as usize
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let state = self.state.lock().unwrap();
        let index = Self::index_of(&state, key);
        let bucket = state.slots[index].lock().unwrap();
        bucket.find(key).cloned()
    }

    pub fn remove(&self, key: &K) -> bool {
        let state = self.state.lock().unwrap();
        let index = Self::index_of(&state, key);
        let mut bucket = state.slots[index].lock().unwrap();
        bucket.remove(key)
    }

    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock().unwrap();

        // A single key may collide with every item in its bucket and force
        // several consecutive splits before room appears.
        loop {
            let index = Self::index_of(&state, &key);

            {
                let mut bucket = state.slots[index].lock().unwrap();
                if bucket.insert(key.clone(), value.clone()) {
                    return;
                }
            }

            let local_depth = state.slots[index].lock().unwrap().depth;
            if local_depth == state.global_depth {
                Self::double_directory(&mut state);
            }

            let index = Self::index_of(&state, &key);
            Self::split_bucket(&mut state, index);
        }
    }

    // Appends a shallow copy of the directory to itself: each new slot
    // shares the bucket of its low-bit-cleared counterpart.
    fn double_directory(state: &mut Directory<K, V>) {
        for i in 0..(1usize << state.global_depth) {
            let shared = Arc::clone(&state.slots[i]);
            state.slots.push(shared);
        }
        state.global_depth += 1;
    }

    // Splits the bucket behind `index` into itself and a fresh sibling at
    // depth + 1, redistributing items by one more hash bit and repointing
    // the directory slots that now belong to the sibling.
    fn split_bucket(state: &mut Directory<K, V>, index: usize) {
        let bucket_ref = Arc::clone(&state.slots[index]);
        let mut bucket = bucket_ref.lock().unwrap();

        state.num_buckets += 1;
        bucket.depth += 1;
        let new_depth = bucket.depth;

        // Items staying behind keep the slot-index pattern the bucket served
        // before the split; items whose next hash bit differs move over.
        let surviving = low_bits(index as u64, new_depth - 1);

        let mut sibling = Bucket::new(bucket.capacity, new_depth);
        let mut kept = Vec::with_capacity(bucket.items.len());
        for (k, v) in bucket.items.drain(..) {
            if low_bits(stable_hash(&k), new_depth) == surviving {
                kept.push((k, v));
            } else {
                sibling.items.push((k, v));
            }
        }
        bucket.items = kept;
        drop(bucket);

        let sibling = Arc::new(Mutex::new(sibling));
        for i in 0..(1usize << state.global_depth) {
            if low_bits(i as u64, new_depth - 1) == surviving
                && low_bits(i as u64, new_depth) != surviving
            {
                state.slots[i] = Arc::clone(&sibling);
            }
        }
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;
    use std::thread;

    use crate::container::extendible_hash_table::{stable_hash, ExtendibleHashTable};

    // Scans upward from `start` for a key whose hash carries `pattern` in
    // its low `bits` bits. Placement uses the same stable hash, so tests
    // can steer keys into chosen directory slots.
    fn key_with_pattern(start: u32, pattern: u64, bits: usize) -> u32 {
        let mask = (1u64 << bits) - 1;
        (start..)
            .find(|k| stable_hash(k) & mask == pattern)
            .unwrap()
    }

    #[test]
    fn find_returns_the_latest_insert() {
        let table: ExtendibleHashTable<u32, String> = ExtendibleHashTable::new(4);

        assert_eq!(table.find(&1), None);
        table.insert(1, "a".to_string());
        assert_eq!(table.find(&1), Some("a".to_string()));

        // Upsert in place.
        table.insert(1, "b".to_string());
        assert_eq!(table.find(&1), Some("b".to_string()));
        assert_eq!(table.num_buckets(), 1);
    }

    #[test]
    fn remove_deletes_exactly_the_given_key() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        table.insert(2, 20);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert_eq!(table.find(&2), Some(20));
    }

    #[test]
    fn overflow_splits_the_bucket_and_doubles_the_directory() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);

        // Two keys landing in the even half of a depth-1 directory, one in
        // the odd half. The third insert overflows the single bucket.
        let k1 = key_with_pattern(0, 0, 1);
        let k2 = key_with_pattern(k1 + 1, 0, 1);
        let k3 = key_with_pattern(0, 1, 1);

        table.insert(k1, 1);
        table.insert(k2, 2);
        assert_eq!(table.global_depth(), 0);

        table.insert(k3, 3);
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.distinct_buckets(), 2);

        assert_eq!(table.find(&k1), Some(1));
        assert_eq!(table.find(&k2), Some(2));
        assert_eq!(table.find(&k3), Some(3));
    }

    #[test]
    fn colliding_keys_force_repeated_splits() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(1);

        // Keys sharing their low two hash bits can only separate once the
        // directory resolves at least three bits.
        let k1 = key_with_pattern(0, 0b00, 2);
        let k2 = key_with_pattern(k1 + 1, 0b00, 2);

        table.insert(k1, 1);
        table.insert(k2, 2);

        assert!(table.global_depth() >= 2);
        assert_eq!(table.find(&k1), Some(1));
        assert_eq!(table.find(&k2), Some(2));
    }

    #[test]
    fn local_depth_never_exceeds_global_depth() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(3);

        for k in 0..200 {
            table.insert(k, k * 2);

            let global = table.global_depth();
            for slot in 0..(1usize << global) {
                assert!(table.local_depth(slot) <= global);
            }
        }

        for k in 0..200 {
            assert_eq!(table.find(&k), Some(k * 2));
        }
        assert!(table.num_buckets() <= 1 << table.global_depth());
        assert_eq!(table.num_buckets(), table.distinct_buckets());
    }

    #[test]
    fn mixed_workload_stays_consistent() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);

        for k in 0..64 {
            table.insert(k, k);
        }
        for k in (0..64).step_by(2) {
            assert!(table.remove(&k));
        }
        for k in 0..64 {
            let expected = if k % 2 == 0 { None } else { Some(k) };
            assert_eq!(table.find(&k), expected);
        }
    }

    #[test]
    fn concurrent_inserts_are_all_visible() {
        let table: Arc<ExtendibleHashTable<u32, u32>> = Arc::new(ExtendibleHashTable::new(2));

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for k in (t * 100)..(t * 100 + 100) {
                        table.insert(k, k + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for k in 0..400 {
            assert_eq!(table.find(&k), Some(k + 1));
        }
    }
}

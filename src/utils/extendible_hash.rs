use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// In-memory extendible hash table.
///
/// The directory is a vector of shared bucket handles: several slots whose
/// indices agree on the low `local_depth` bits point at the same bucket, so
/// buckets are reference-counted rather than owned by a single slot. The
/// buffer pool uses this as its page-id to frame-id table.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    dir: RwLock<Directory<K, V>>,
}

#[derive(Debug)]
struct Directory<K, V> {
    global_depth: u32,
    slots: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

#[derive(Debug)]
struct Bucket<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32, capacity: usize) -> Self {
        Self {
            local_depth,
            items: Vec::with_capacity(capacity),
        }
    }
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0);
        Self {
            bucket_size,
            dir: RwLock::new(Directory {
                global_depth: 0,
                slots: vec![Arc::new(Mutex::new(Bucket::new(0, bucket_size)))],
            }),
        }
    }

    fn slot_index(key_hash: u64, global_depth: u32) -> usize {
        (key_hash as usize) & ((1usize << global_depth) - 1)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        // the directory read lock pins the slot->bucket mapping while the
        // bucket is inspected; splits take the directory lock exclusively
        let dir = self.dir.read();
        let index = Self::slot_index(hash_key(key), dir.global_depth);
        let bucket = dir.slots[index].lock();
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or replace. Splits the target bucket (doubling the directory
    /// when its local depth has caught up with the global depth) until the
    /// entry fits.
    pub fn insert(&self, key: K, value: V) {
        loop {
            {
                // hold the directory read lock across the bucket mutation so
                // a concurrent split cannot redirect the slot underneath us
                let dir = self.dir.read();
                let index = Self::slot_index(hash_key(&key), dir.global_depth);
                let mut bucket = dir.slots[index].lock();
                if let Some(slot) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = value;
                    return;
                }
                if bucket.items.len() < self.bucket_size {
                    bucket.items.push((key, value));
                    return;
                }
            }
            // full bucket: split under the directory write lock, then retry
            self.split_target_of(&key);
        }
    }

    fn split_target_of(&self, key: &K) {
        let mut dir = self.dir.write();
        let index = Self::slot_index(hash_key(key), dir.global_depth);
        let bucket_arc = dir.slots[index].clone();
        let mut bucket = bucket_arc.lock();
        if bucket.items.len() < self.bucket_size {
            // another thread split first
            return;
        }

        let old_depth = bucket.local_depth;
        if old_depth == dir.global_depth {
            let doubled = dir.slots.clone();
            dir.slots.extend(doubled);
            dir.global_depth += 1;
        }

        let new_depth = old_depth + 1;
        bucket.local_depth = new_depth;
        let mut sibling = Bucket::new(new_depth, self.bucket_size);

        // redistribute by the bit that now distinguishes the pair
        let mut keep = Vec::with_capacity(self.bucket_size);
        for (k, v) in bucket.items.drain(..) {
            if (hash_key(&k) >> old_depth) & 1 == 1 {
                sibling.items.push((k, v));
            } else {
                keep.push((k, v));
            }
        }
        bucket.items = keep;

        let sibling = Arc::new(Mutex::new(sibling));
        for i in 0..dir.slots.len() {
            if Arc::ptr_eq(&dir.slots[i], &bucket_arc) && (i >> old_depth) & 1 == 1 {
                dir.slots[i] = sibling.clone();
            }
        }
    }

    /// Remove a key, merging an emptied bucket with its split image when both
    /// share the same nonzero local depth, and contracting the directory when
    /// every bucket sits below the global depth.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut dir = self.dir.write();
        let index = Self::slot_index(hash_key(key), dir.global_depth);
        let bucket_arc = dir.slots[index].clone();
        let value = {
            let mut bucket = bucket_arc.lock();
            let position = bucket.items.iter().position(|(k, _)| k == key)?;
            bucket.items.remove(position).1
        };
        self.merge_empty(&mut dir, index);
        self.shrink_directory(&mut dir);
        Some(value)
    }

    fn merge_empty(&self, dir: &mut Directory<K, V>, start: usize) {
        let mut index = start;
        loop {
            let bucket_arc = dir.slots[index].clone();
            let (empty, local) = {
                let bucket = bucket_arc.lock();
                (bucket.items.is_empty(), bucket.local_depth)
            };
            if !empty || local == 0 {
                return;
            }
            let image_index = index ^ (1usize << (local - 1));
            let image_arc = dir.slots[image_index].clone();
            if Arc::ptr_eq(&image_arc, &bucket_arc) {
                return;
            }
            {
                let mut image = image_arc.lock();
                if image.local_depth != local {
                    return;
                }
                image.local_depth = local - 1;
            }
            for slot in dir.slots.iter_mut() {
                if Arc::ptr_eq(slot, &bucket_arc) {
                    *slot = image_arc.clone();
                }
            }
            // the surviving image may itself be empty; keep folding
            index = image_index;
        }
    }

    fn shrink_directory(&self, dir: &mut Directory<K, V>) {
        while dir.global_depth > 0 {
            let all_below = dir
                .slots
                .iter()
                .all(|bucket| bucket.lock().local_depth < dir.global_depth);
            if !all_below {
                break;
            }
            let half = dir.slots.len() / 2;
            dir.slots.truncate(half);
            dir.global_depth -= 1;
        }
    }

    pub fn len(&self) -> usize {
        let dir = self.dir.read();
        let mut seen: Vec<*const Mutex<Bucket<K, V>>> = Vec::new();
        let mut total = 0;
        for bucket in dir.slots.iter() {
            let ptr = Arc::as_ptr(bucket);
            if !seen.contains(&ptr) {
                seen.push(ptr);
                total += bucket.lock().items.len();
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_depth(&self) -> u32 {
        self.dir.read().global_depth
    }

    pub fn local_depth(&self, slot: usize) -> u32 {
        let dir = self.dir.read();
        let local_depth = dir.slots[slot].lock().local_depth;
        local_depth
    }

    /// Directory invariants: power-of-two size, `local <= global`, and
    /// walking slot `i` by stride `2^local_depth(i)` visits exactly the slots
    /// sharing `i`'s bucket.
    pub fn verify_integrity(&self) {
        let dir = self.dir.read();
        assert_eq!(dir.slots.len(), 1usize << dir.global_depth);
        for i in 0..dir.slots.len() {
            let bucket = &dir.slots[i];
            let local = bucket.lock().local_depth;
            assert!(local <= dir.global_depth);
            let stride = 1usize << local;
            for j in 0..dir.slots.len() {
                let shares_suffix = j % stride == i % stride;
                let shares_bucket = Arc::ptr_eq(&dir.slots[j], bucket);
                assert_eq!(
                    shares_suffix, shares_bucket,
                    "slot {} vs {} stride {}",
                    i, j, stride
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn insert_and_get() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);
        for i in 0..64u32 {
            table.insert(i, i * 10);
            table.verify_integrity();
        }
        for i in 0..64u32 {
            assert_eq!(table.get(&i), Some(i * 10));
        }
        assert_eq!(table.get(&1000), None);
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn insert_replaces_existing() {
        let table: ExtendibleHashTable<u32, &'static str> = ExtendibleHashTable::new(2);
        table.insert(7, "old");
        table.insert(7, "new");
        assert_eq!(table.get(&7), Some("new"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn overflow_doubles_directory() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);
        assert_eq!(table.global_depth(), 0);
        for i in 0..32u32 {
            table.insert(i, i);
        }
        assert!(table.global_depth() >= 1);
        table.verify_integrity();
    }

    #[test]
    fn remove_and_merge() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);
        for i in 0..16u32 {
            table.insert(i, i);
        }
        for i in 0..16u32 {
            assert_eq!(table.remove(&i), Some(i));
            table.verify_integrity();
        }
        assert!(table.is_empty());
        assert_eq!(table.remove(&0), None);
    }

    #[test]
    fn concurrent_inserts_and_reads() {
        let table: Arc<ExtendibleHashTable<u32, u32>> = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..256u32 {
                    let key = t * 1000 + i;
                    table.insert(key, key);
                    assert_eq!(table.get(&key), Some(key));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 4 * 256);
        table.verify_integrity();
    }
}

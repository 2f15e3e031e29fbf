use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fixed-stripe concurrent hash map.
///
/// The stripe count is fixed at construction (2^stripe_exponent, exponent in
/// 0..=9); the bucket table starts at 4 × stripes and only grows, always by
/// doubling, always staying a power of two. A key's stripe is
/// `hash % stripes` and its bucket `hash % buckets`; because the bucket count
/// is a multiple of the stripe count, every bucket belongs to exactly one
/// stripe and doubling never moves an entry across stripes. Each operation
/// touches exactly one stripe, so readers and writers cannot deadlock.
pub struct ShardedMap<K, V> {
    stripes: Vec<Mutex<Stripe<K, V>>>,
    /// Total bucket count across stripes. Consistent reads happen under a
    /// stripe lock; resize holds every stripe lock while changing it.
    bucket_count: AtomicUsize,
    init_bucket_count: usize,
    size: AtomicU64,
}

struct Stripe<K, V> {
    /// Buckets owned by this stripe, indexed by `bucket_id / stripe_count`.
    buckets: Vec<Vec<(K, V)>>,
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// `stripe_exponent` must be in 0..=9.
    pub fn new(stripe_exponent: u32) -> Self {
        assert!(stripe_exponent <= 9, "stripe exponent out of range");
        let stripe_count = 1usize << stripe_exponent;
        let init_bucket_count = stripe_count * 4;
        let stripes = (0..stripe_count)
            .map(|_| {
                Mutex::new(Stripe {
                    buckets: vec![Vec::new(); init_bucket_count / stripe_count],
                })
            })
            .collect();
        Self {
            stripes,
            bucket_count: AtomicUsize::new(init_bucket_count),
            init_bucket_count,
            size: AtomicU64::new(0),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count.load(Ordering::Acquire)
    }

    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_hash(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn lock_stripe(&self, key: &K) -> (MutexGuard<'_, Stripe<K, V>>, usize) {
        let h = Self::key_hash(key);
        let stripe_id = (h as usize) % self.stripes.len();
        let guard = self.stripes[stripe_id].lock();
        // Read the bucket count only while holding the stripe lock; a
        // concurrent resize holds every stripe lock.
        let buckets = self.bucket_count.load(Ordering::Acquire);
        let bucket_id = (h as usize) % buckets;
        (guard, bucket_id / self.stripes.len())
    }

    /// Insert if absent. Returns false on duplicate key.
    pub fn insert(&self, key: K, value: V) -> bool {
        let inserted = {
            let (mut stripe, local) = self.lock_stripe(&key);
            let bucket = &mut stripe.buckets[local];
            if bucket.iter().any(|(k, _)| *k == key) {
                false
            } else {
                bucket.push((key, value));
                self.size.fetch_add(1, Ordering::AcqRel);
                true
            }
        };
        if inserted && self.should_grow() {
            self.resize();
        }
        inserted
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let (stripe, local) = self.lock_stripe(key);
        stripe.buckets[local]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert only if the key is absent.
    pub fn try_insert(&self, key: K, value: V) -> bool {
        self.insert(key, value)
    }

    /// Replace the current value only if it equals `expected`.
    /// Returns false when the key is absent or holds a different value.
    pub fn try_update(&self, key: &K, expected: &V, new: V) -> bool {
        let (mut stripe, local) = self.lock_stripe(key);
        let bucket = &mut stripe.buckets[local];
        match bucket.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) if *v == *expected => {
                *v = new;
                true
            }
            _ => false,
        }
    }

    /// Compare-and-swap: `expected = None` means "insert only if absent",
    /// otherwise the value is swapped only if it currently equals `expected`.
    pub fn compare_and_swap(&self, key: K, expected: Option<&V>, new: V) -> bool {
        match expected {
            None => self.try_insert(key, new),
            Some(e) => self.try_update(&key, e, new),
        }
    }

    pub fn remove(&self, key: &K) -> bool {
        let (mut stripe, local) = self.lock_stripe(key);
        let bucket = &mut stripe.buckets[local];
        if let Some(pos) = bucket.iter().position(|(k, _)| k == key) {
            bucket.swap_remove(pos);
            self.size.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Drop every entry and shrink back to the initial bucket table.
    pub fn clear(&self) {
        let mut guards: Vec<_> = self.stripes.iter().map(|m| m.lock()).collect();
        for stripe in guards.iter_mut() {
            stripe.buckets.clear();
            stripe
                .buckets
                .resize(self.init_bucket_count / self.stripes.len(), Vec::new());
        }
        self.bucket_count
            .store(self.init_bucket_count, Ordering::Release);
        self.size.store(0, Ordering::Release);
    }

    fn should_grow(&self) -> bool {
        self.len() >= (self.bucket_count() * 4) as u64
    }

    /// Double the bucket table. Takes every stripe lock in order, then
    /// re-checks the size so a racing resize degrades to a no-op.
    fn resize(&self) {
        let mut guards: Vec<_> = self.stripes.iter().map(|m| m.lock()).collect();
        if !self.should_grow() {
            return;
        }

        let old_total = self.bucket_count.load(Ordering::Acquire);
        let new_total = old_total * 2;
        let stripe_count = self.stripes.len();

        for (stripe_id, stripe) in guards.iter_mut().enumerate() {
            let old_local = stripe.buckets.len();
            stripe.buckets.resize(old_local * 2, Vec::new());
            for local in 0..old_local {
                let mut keep = Vec::new();
                let drained = std::mem::take(&mut stripe.buckets[local]);
                for (k, v) in drained {
                    let new_bucket = (Self::key_hash(&k) as usize) % new_total;
                    debug_assert_eq!(new_bucket % stripe_count, stripe_id);
                    let new_local = new_bucket / stripe_count;
                    if new_local == local {
                        keep.push((k, v));
                    } else {
                        // Doubling can only send an entry to the new half.
                        debug_assert_eq!(new_local, local + old_local);
                        stripe.buckets[new_local].push((k, v));
                    }
                }
                stripe.buckets[local] = keep;
            }
        }

        self.bucket_count.store(new_total, Ordering::Release);
    }
}

// Cuckoo Filter for approximate connection tracking
// A probabilistic set-membership structure answering "have I seen this flow?"
// under a fixed, caller-chosen memory budget. Unlike a Bloom filter it
// supports deletion, which a connection tracker needs when flows close.

use derive_builder::Builder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Error type for Cuckoo Filter insert operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Returned when the kick budget is exhausted and the item cannot be placed
    #[error("not enough space to store this item")]
    NotEnoughSpace,
}

/// Occupancy snapshot returned by [`CuckooFilter::stats`]
///
/// `load_factor` is `count / capacity_slots`; provisioning logic outside the
/// filter watches it to decide whether the table was sized large enough.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterStats {
    /// Number of fingerprints currently stored
    pub count: usize,
    /// Total slots in the table (`num_buckets * bucket_size`)
    pub capacity_slots: usize,
    /// `count` divided by `capacity_slots`
    pub load_factor: f64,
}

/// An approximate membership filter over connection identifiers (or any
/// hashable items), based on partial-key cuckoo hashing.
///
/// ## Algorithm
///
/// 1. **Fingerprints**: each item is reduced to a small non-zero fingerprint
///    (1-32 bits); the item itself is never stored. Distinct items sharing a
///    fingerprint are the sole source of false positives.
///
/// 2. **Two candidate buckets**: the primary bucket comes from the item hash;
///    the alternate is `primary XOR hash(fingerprint)`. Because the alternate
///    is derived from the fingerprint alone, an evicted fingerprint can be
///    relocated without ever re-hashing the original item.
///
/// 3. **Bounded eviction**: when both candidate buckets are full, a victim
///    fingerprint is kicked to its alternate bucket, possibly displacing
///    another, up to `max_kicks` steps. The chain is planned first and applied
///    only if it ends at a free slot, so a failed insert leaves the table
///    exactly as it was: nothing stored, nothing lost, `len()` unchanged, and
///    an immediate retry fails the same way.
///
/// ## Contract
///
/// - `insert(x)` then `contains(x)` is `true` until `delete(x)`: successfully
///   inserted items are never false negatives (evictions relocate, they never
///   drop an occupant).
/// - `contains` and `delete` touch at most two buckets; `insert` performs at
///   most `max_kicks` relocations. No operation blocks or retries unboundedly.
/// - `delete` removes one matching fingerprint, which under a collision may
///   belong to a different item; that yields a spurious miss for the collider,
///   never table corruption.
///
/// The filter is a single-owner structure: lookups take `&self`, mutations
/// take `&mut self`, and callers needing sharing wrap it themselves.
#[derive(Debug, Builder)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "base_build", validate = "Self::validate")
)]
pub struct CuckooFilter<H = DefaultHasher>
where
    H: Hasher + Default,
{
    // Configuration parameters
    /// Maximum number of fingerprints the filter can store
    #[builder(default = "1048576")]
    capacity: usize,

    /// Size of fingerprints in bits (1 to 32)
    #[builder(default = "16")]
    fingerprint_size: usize,

    /// Number of fingerprint slots per bucket
    #[builder(default = "4")]
    bucket_size: usize,

    /// Maximum number of relocations to try before an insert gives up
    #[builder(default = "500")]
    max_kicks: usize,

    /// Seed for the eviction RNG; unseeded filters draw from OS entropy.
    /// Fixing the seed makes eviction chains reproducible under test.
    #[builder(default, setter(strip_option))]
    seed: Option<u64>,

    // Internal values - derived from the configuration
    /// Number of buckets in the table (power of 2)
    #[builder(setter(skip))]
    num_buckets: usize,

    /// Bit mask selecting the fingerprint bits
    #[builder(setter(skip))]
    fingerprint_mask: u32,

    /// Slot storage, `num_buckets * bucket_size` entries; 0 marks an empty slot
    #[builder(setter(skip))]
    slots: Vec<u32>,

    /// Number of fingerprints currently stored
    #[builder(setter(skip))]
    count: usize,

    /// Cumulative relocations applied by successful inserts
    #[builder(setter(skip))]
    relocations: u64,

    /// Random source for victim selection in the kick loop
    #[builder(setter(skip), default = "StdRng::from_os_rng()")]
    rng: StdRng,

    /// Phantom data for the hasher type
    #[builder(setter(skip))]
    _hasher: PhantomData<H>,
}

impl<H: Hasher + Default> CuckooFilter<H> {
    /// Insert an item into the filter.
    ///
    /// Probes both candidate buckets for a free slot and falls back to the
    /// bounded eviction chain when both are full.
    ///
    /// Returns `Ok(())` if the item was stored, or [`Error::NotEnoughSpace`]
    /// if the kick budget ran out. A failed insert changes no filter state;
    /// the caller should treat the item as untrackable (e.g. fall back to an
    /// exact path) rather than retry blindly.
    pub fn insert<T: ?Sized + Hash>(&mut self, item: &T) -> Result<(), Error> {
        let (index, fingerprint) = self.index_and_fingerprint(item);
        self.insert_fingerprint(index, fingerprint)
    }

    /// Insert an item only if it is not already present.
    ///
    /// Returns `Ok(true)` if the item was inserted, `Ok(false)` if a matching
    /// fingerprint already occupies a candidate bucket (the item, or a
    /// collider, is already tracked), or [`Error::NotEnoughSpace`] if the
    /// filter is full.
    pub fn insert_unique<T: ?Sized + Hash>(&mut self, item: &T) -> Result<bool, Error> {
        let (index, fingerprint) = self.index_and_fingerprint(item);
        if self.lookup_fingerprint(index, fingerprint).is_some() {
            return Ok(false);
        }
        self.insert_fingerprint(index, fingerprint).map(|_| true)
    }

    /// Check if an item is in the filter.
    ///
    /// Returns `true` if the item is possibly present (false positives occur
    /// when another item's fingerprint collides in a candidate bucket),
    /// `false` if it is definitely not present.
    pub fn contains<T: ?Sized + Hash>(&self, item: &T) -> bool {
        let (index, fingerprint) = self.index_and_fingerprint(item);
        self.lookup_fingerprint(index, fingerprint).is_some()
    }

    /// Remove one instance of an item from the filter.
    ///
    /// Scans the primary bucket, then the alternate, and clears the first
    /// matching slot. Returns `true` if a fingerprint was removed, `false` if
    /// none matched. Deleting an item that was never inserted may remove a
    /// colliding item's fingerprint instead; only insert-then-delete is
    /// collision-safe.
    pub fn delete<T: ?Sized + Hash>(&mut self, item: &T) -> bool {
        let (index, fingerprint) = self.index_and_fingerprint(item);
        if let Some((bucket, slot)) = self.lookup_fingerprint(index, fingerprint) {
            self.bucket_mut(bucket)[slot] = 0;
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// Count matching fingerprints across an item's two candidate buckets.
    ///
    /// # Notes
    /// - This is not a counting filter; it reports duplicate insertions and
    ///   fingerprint collisions, capped at `2 * bucket_size`.
    /// - Collisions from other items inflate the count.
    pub fn count<T: ?Sized + Hash>(&self, item: &T) -> usize {
        let (index, fingerprint) = self.index_and_fingerprint(item);
        let alt_index = self.alt_index(index, fingerprint);
        let primary = self
            .bucket(index)
            .iter()
            .filter(|&&fp| fp == fingerprint)
            .count();
        if alt_index == index {
            return primary;
        }
        primary
            + self
                .bucket(alt_index)
                .iter()
                .filter(|&&fp| fp == fingerprint)
                .count()
    }

    /// Get the number of fingerprints in the filter
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if the filter is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Get the capacity of the filter in slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cumulative number of fingerprint relocations applied by successful
    /// inserts. Each insert contributes at most `max_kicks`; a growing rate
    /// here means the table is running hot.
    pub fn relocations(&self) -> u64 {
        self.relocations
    }

    /// Occupancy snapshot: stored count, total slots, and load factor
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            count: self.count,
            capacity_slots: self.capacity,
            load_factor: self.count as f64 / self.capacity as f64,
        }
    }

    /// Clear the filter, removing all fingerprints
    pub fn clear(&mut self) {
        self.slots.fill(0);
        self.count = 0;
    }

    /// Compute the hash of an item with the configured hasher type
    fn hash<T: ?Sized + Hash>(&self, data: &T) -> u64 {
        let mut hasher = <H as Default>::default();
        data.hash(&mut hasher);
        hasher.finish()
    }

    /// Compute the primary bucket index and fingerprint for an item.
    ///
    /// The index comes from the low hash bits (masked, since `num_buckets` is
    /// a power of two); the fingerprint comes from the high bits via a
    /// multiply-shift against the fingerprint mask, plus one so it can never
    /// be the empty-slot sentinel. Using disjoint bit ranges keeps index and
    /// fingerprint effectively independent.
    fn index_and_fingerprint<T: ?Sized + Hash>(&self, item: &T) -> (usize, u32) {
        let hash = self.hash(item);
        let fingerprint = ((hash as u128 * self.fingerprint_mask as u128) >> 64) + 1;
        let index = hash as usize & (self.num_buckets - 1);
        (index, fingerprint as u32)
    }

    /// Compute the alternate bucket index for a fingerprint.
    ///
    /// Partial-key cuckoo hashing: the alternate is derived from the stored
    /// fingerprint alone, so relocation never needs the original item.
    /// The mapping is an involution: `alt_index(alt_index(i, f), f) == i`.
    fn alt_index(&self, index: usize, fingerprint: u32) -> usize {
        index ^ (self.hash(&fingerprint) as usize & (self.num_buckets - 1))
    }

    /// The slots of bucket `index`
    fn bucket(&self, index: usize) -> &[u32] {
        &self.slots[index * self.bucket_size..(index + 1) * self.bucket_size]
    }

    fn bucket_mut(&mut self, index: usize) -> &mut [u32] {
        &mut self.slots[index * self.bucket_size..(index + 1) * self.bucket_size]
    }

    /// Look up a fingerprint in its primary bucket, then its alternate.
    /// Returns `Some((bucket, slot))` of the first match, `None` otherwise.
    fn lookup_fingerprint(&self, index: usize, fingerprint: u32) -> Option<(usize, usize)> {
        self.bucket(index)
            .iter()
            .position(|&fp| fp == fingerprint)
            .map(|slot| (index, slot))
            .or_else(|| {
                let alt_index = self.alt_index(index, fingerprint);
                self.bucket(alt_index)
                    .iter()
                    .position(|&fp| fp == fingerprint)
                    .map(|slot| (alt_index, slot))
            })
    }

    /// Place a fingerprint: primary bucket, alternate bucket, then evictions
    fn insert_fingerprint(&mut self, index: usize, fingerprint: u32) -> Result<(), Error> {
        if self.insert_at_bucket(index, fingerprint) {
            return Ok(());
        }
        let alt_index = self.alt_index(index, fingerprint);
        if self.insert_at_bucket(alt_index, fingerprint) {
            return Ok(());
        }
        if self.max_kicks == 0 {
            return Err(Error::NotEnoughSpace);
        }
        self.insert_with_kicks(index, alt_index, fingerprint)
    }

    /// Write a fingerprint into the first empty slot of a bucket.
    /// Returns `true` on success, `false` if the bucket is full.
    fn insert_at_bucket(&mut self, index: usize, fingerprint: u32) -> bool {
        if let Some(slot) = self.bucket(index).iter().position(|&fp| fp == 0) {
            self.bucket_mut(index)[slot] = fingerprint;
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Insert a fingerprint by relocating existing occupants when both
    /// candidate buckets are full.
    ///
    /// The chain starts at a uniformly random one of the two candidates. Each
    /// step picks a victim slot in the current full bucket (random on the
    /// first visit, then untried slots via a per-bucket bitmap so a cycling
    /// chain is detected early), records the planned swap, and follows the
    /// victim's alternate bucket. Nothing is written until a bucket with a
    /// free slot terminates the chain; the planned swaps are then applied in
    /// reverse. A chain that exhausts `max_kicks` therefore leaves the table
    /// untouched and the insert fails with no state change at all.
    fn insert_with_kicks(
        &mut self,
        index: usize,
        alt_index: usize,
        fingerprint: u32,
    ) -> Result<(), Error> {
        let mut index = if self.rng.random_bool(0.5) {
            index
        } else {
            alt_index
        };
        let mut fingerprint = fingerprint;
        let mut kicks = Vec::with_capacity(self.max_kicks.min(32));
        let mut tried_slots = HashMap::with_capacity(self.max_kicks.min(32));
        while kicks.len() < self.max_kicks {
            let slot = match tried_slots.entry(index).or_insert(0usize) {
                tried if *tried == 0 => {
                    // First visit to this bucket, evict a random slot
                    let slot = self.rng.random_range(0..self.bucket_size);
                    *tried = 1 << slot;
                    slot
                }
                tried => {
                    // Revisit, pick a slot the chain has not claimed yet
                    match (0..self.bucket_size).find(|slot| (*tried >> slot) & 1 == 0) {
                        Some(slot) => {
                            *tried |= 1 << slot;
                            slot
                        }
                        // Every slot in this bucket is already on the chain
                        None => return Err(Error::NotEnoughSpace),
                    }
                }
            };
            let evicted = self.bucket(index)[slot];
            kicks.push((index, slot, fingerprint));
            // Follow the evicted fingerprint to its alternate bucket
            index = self.alt_index(index, evicted);
            fingerprint = evicted;
            if self.insert_at_bucket(index, fingerprint) {
                // The chain ends at a free slot, apply the planned swaps
                for &(index, slot, incoming) in kicks.iter().rev() {
                    self.bucket_mut(index)[slot] = incoming;
                }
                self.relocations += kicks.len() as u64;
                return Ok(());
            }
        }
        // Kick budget exhausted, nothing was written
        Err(Error::NotEnoughSpace)
    }
}

impl CuckooFilter<DefaultHasher> {
    /// Create a new CuckooFilterBuilder with default settings
    pub fn builder() -> CuckooFilterBuilder<DefaultHasher> {
        CuckooFilterBuilder::default()
    }

    /// Create a new CuckooFilter with default settings
    pub fn new() -> CuckooFilter<DefaultHasher> {
        Self::builder().build().unwrap()
    }

    /// Create a new CuckooFilter with the specified capacity
    pub fn with_capacity(capacity: usize) -> CuckooFilter<DefaultHasher> {
        Self::builder().capacity(capacity).build().unwrap()
    }
}

impl Default for CuckooFilter<DefaultHasher> {
    /// Create a new CuckooFilter with default settings
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hasher + Default> CuckooFilterBuilder<H> {
    /// Validate the builder configuration
    fn validate(&self) -> Result<(), String> {
        if let Some(fingerprint_size) = self.fingerprint_size {
            if !(1..=32).contains(&fingerprint_size) {
                return Err("fingerprint_size must be between 1 and 32 bits".into());
            }
        }
        if let Some(bucket_size) = self.bucket_size {
            if bucket_size == 0 {
                return Err("bucket_size must be greater than zero".into());
            }
            if bucket_size > 64 {
                return Err("bucket_size must not exceed 64".into());
            }
        }
        if self.capacity == Some(0) {
            return Err("capacity must be greater than zero".into());
        }
        Ok(())
    }

    /// Build a CuckooFilter with the specified configuration
    pub fn build(self) -> Result<CuckooFilter<H>, CuckooFilterBuilderError> {
        let mut filter = self.base_build()?;
        // Calculate the number of buckets (power of 2, for the XOR alternate)
        filter.num_buckets = filter
            .capacity
            .div_ceil(filter.bucket_size)
            .next_power_of_two();
        // Adjust the capacity to match the actual number of buckets
        filter.capacity = filter.num_buckets * filter.bucket_size;
        filter.fingerprint_mask = ((1u64 << filter.fingerprint_size) - 1) as u32;
        filter.slots = vec![0; filter.capacity];
        if let Some(seed) = filter.seed {
            filter.rng = StdRng::seed_from_u64(seed);
        }
        Ok(filter)
    }
}

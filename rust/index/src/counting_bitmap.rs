//! Occurrence-counting multiplicity sieve over compressed id sets.
//!
//! A `CountingBitmap` of capacity `n` is a cascade of roaring bitmaps
//! `S_0 ⊇ S_1 ⊇ … ⊇ S_{n−1}` where layer `j` holds every id that has
//! appeared in at least `j + 1` of the sets unioned in so far:
//!
//! ```text
//! S_j = { x : count(x) ≥ j + 1 }
//! ```
//!
//! `or` promotes each incoming id by one occurrence (capped at the cascade
//! depth) with set operations only: the ids already present in a layer carry
//! to the next one, so a single pass keeps every layer consistent. The
//! cascade trades per-id counters for the bitmap library's vectorized
//! union/intersection kernels, which wins when most unions are large.

use roaring::RoaringBitmap;

pub struct CountingBitmap {
    layers: Vec<RoaringBitmap>,
}

impl CountingBitmap {
    /// Creates a cascade able to count occurrences up to `max_count`.
    pub fn new(max_count: usize) -> Self {
        assert!(max_count > 0, "counting bitmap capacity must be positive");
        CountingBitmap {
            layers: vec![RoaringBitmap::new(); max_count],
        }
    }

    /// Unions `input` into the cascade, raising each contained id's count by
    /// one (saturating at the capacity).
    pub fn or(&mut self, input: RoaringBitmap) {
        let mut carry = input;
        for layer in self.layers.iter_mut() {
            if carry.is_empty() {
                break;
            }
            let promoted = &carry & &*layer;
            *layer |= &carry;
            carry = promoted;
        }
    }

    /// Returns the deepest layer holding at least `k` ids, falling back to
    /// layer 0 when none qualifies. The result may hold more than `k` ids;
    /// callers re-rank and trim.
    pub fn top_k(&self, k: usize) -> &RoaringBitmap {
        for (i, layer) in self.layers.iter().enumerate().rev() {
            if i != 0 && layer.len() < k as u64 {
                continue;
            }
            return layer;
        }
        unreachable!("layer 0 always qualifies")
    }

    /// Number of unions `id` has appeared in, capped at the capacity.
    pub fn count(&self, id: u32) -> usize {
        self.layers.iter().take_while(|layer| layer.contains(id)).count()
    }

    /// Per-layer cardinalities, deepest last. Diagnostic only.
    pub fn cardinalities(&self) -> Vec<u64> {
        self.layers.iter().map(|layer| layer.len()).collect()
    }
}

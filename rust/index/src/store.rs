//! The bit-basis quantization vector store.
//!
//! ## Index structure
//!
//! The store draws `nbasis` independent random orthonormal bases of ℝ^d.
//! Every stored vector is assigned, per basis, to the `pre_spill` signed
//! axes with the largest projection magnitude; each signed axis `±(i+1)`
//! owns a roaring bitmap of the ids assigned to it. Two vectors that agree
//! on their strongest signed axis in many independent bases are very likely
//! to be genuine neighbors, which is what the query path exploits:
//!
//! 1. Project the query onto each basis and pick the `spill + 1` strongest
//!    signed axes.
//! 2. Union those partitions per basis and feed each union into a
//!    [`CountingBitmap`], which tracks how many bases proposed each id.
//! 3. Take the deepest cascade layer holding at least `search_k` ids as an
//!    over-approximate candidate set.
//! 4. Re-rank every candidate exactly against the backend and keep the
//!    best `k`.
//!
//! Writes go through `&mut self` and queries through `&self`, so concurrent
//! queries are allowed while a write excludes everything else.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use tracing::{debug, info};

use crate::backend::VectorBackend;
use crate::counting_bitmap::CountingBitmap;
use crate::result::ResultSet;
use crate::types::{BackendError, Basis, Vector, ID};
use bbq_distance::{argmax, argmin, dot, normalize_inplace};

/// Per-basis partition table: one id set per signed axis. Axis `i` occupies
/// slot `2i` for the positive halfspace and `2i + 1` for the negative one,
/// so empty partitions cost an empty bitmap instead of a map entry.
struct PartitionMap {
    partitions: Vec<RoaringBitmap>,
    /// Slots that were ever populated. A slot that was emptied again still
    /// gets persisted so a stale file cannot resurrect removed ids.
    touched: Vec<bool>,
}

impl PartitionMap {
    fn new(dimensions: usize) -> Self {
        PartitionMap {
            partitions: vec![RoaringBitmap::new(); 2 * dimensions],
            touched: vec![false; 2 * dimensions],
        }
    }

    fn slot(index: i32) -> usize {
        debug_assert!(index != 0, "partition index zero is invalid");
        let axis = index.unsigned_abs() as usize - 1;
        2 * axis + usize::from(index < 0)
    }

    fn index_for_slot(slot: usize) -> i32 {
        let axis = (slot / 2 + 1) as i32;
        if slot % 2 == 0 {
            axis
        } else {
            -axis
        }
    }

    fn get(&self, index: i32) -> &RoaringBitmap {
        &self.partitions[Self::slot(index)]
    }

    fn insert(&mut self, index: i32, id: u32) {
        let slot = Self::slot(index);
        self.touched[slot] = true;
        self.partitions[slot].insert(id);
    }

    fn remove_everywhere(&mut self, id: u32) {
        for (slot, bitmap) in self.partitions.iter_mut().enumerate() {
            if bitmap.remove(id) {
                self.touched[slot] = true;
            }
        }
    }

    fn set(&mut self, index: i32, bitmap: RoaringBitmap) {
        self.partitions[Self::slot(index)] = bitmap;
    }
}

pub struct VectorStore<B: VectorBackend> {
    backend: B,
    dimensions: usize,
    nbasis: usize,
    pre_spill: usize,
    bases: Vec<Basis>,
    bms: Vec<PartitionMap>,
    /// Monotonic token handed to `save_bases`; bumps only when the basis
    /// set changes, so repeated syncs skip the rewrite.
    bases_token: u64,
    rng: StdRng,
}

impl<B: VectorBackend> VectorStore<B> {
    /// Opens a store over `backend`. When the backend already holds index
    /// data the persisted bases and partitions are loaded; otherwise a
    /// fresh basis set is generated and synced.
    ///
    /// `pre_spill` is the number of signed axes per basis each id is
    /// inserted into; it is clamped to `[1, d]`.
    pub fn new(backend: B, nbasis: usize, pre_spill: usize) -> Result<Self, BackendError> {
        Self::with_rng(backend, nbasis, pre_spill, StdRng::from_entropy())
    }

    /// Like [`new`](Self::new) with a deterministic basis-generation seed.
    pub fn with_seed(
        backend: B,
        nbasis: usize,
        pre_spill: usize,
        seed: u64,
    ) -> Result<Self, BackendError> {
        Self::with_rng(backend, nbasis, pre_spill, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        backend: B,
        nbasis: usize,
        pre_spill: usize,
        rng: StdRng,
    ) -> Result<Self, BackendError> {
        assert!(nbasis > 0, "nbasis must be positive");
        let info = backend.info();
        let dimensions = info.dimensions;
        let mut store = VectorStore {
            backend,
            dimensions,
            nbasis,
            pre_spill: pre_spill.clamp(1, dimensions),
            bases: Vec::new(),
            bms: (0..nbasis).map(|_| PartitionMap::new(dimensions)).collect(),
            bases_token: 0,
            rng,
        };
        if info.has_index_data {
            store.load_from_backend()?;
        } else {
            store.make_basis();
            store.bases_token = 1;
            store.sync()?;
        }
        Ok(store)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn nbasis(&self) -> usize {
        self.nbasis
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stores `vector` under `id` and indexes it. Re-adding an existing id
    /// first strips it from every partition, so the id ends up indexed only
    /// at the new vector's positions.
    pub fn add_vector(&mut self, id: ID, vector: &[f32]) -> Result<(), BackendError> {
        if self.backend.exists(id) {
            self.remove_from_bitmaps(id);
        }
        self.backend.put_vector(id, vector)?;
        self.add_to_bitmaps(&[id], &[vector]);
        Ok(())
    }

    /// Bulk add with ids `offset, offset+1, …`.
    pub fn add_vectors_with_offset(
        &mut self,
        offset: ID,
        vectors: &[Vector],
    ) -> Result<(), BackendError> {
        let ids: Vec<ID> = (0..vectors.len() as ID).map(|i| offset + i).collect();
        self.add_vectors_with_ids(&ids, vectors)
    }

    /// Bulk add: sequential puts, then a single parallel indexing pass.
    pub fn add_vectors_with_ids(
        &mut self,
        ids: &[ID],
        vectors: &[Vector],
    ) -> Result<(), BackendError> {
        assert_eq!(ids.len(), vectors.len(), "one id per vector");
        for (&id, vector) in ids.iter().zip(vectors) {
            if self.backend.exists(id) {
                self.remove_from_bitmaps(id);
            }
            self.backend.put_vector(id, vector)?;
        }
        self.add_to_bitmaps(ids, vectors);
        Ok(())
    }

    /// Top-`k` approximate nearest neighbors of `vector`. `search_k` bounds
    /// the candidate set taken from the counting cascade before exact
    /// re-ranking; `spill` adds extra signed axes per basis beyond the best
    /// one and is clamped to `[0, d−1]`.
    pub fn find_nearest(
        &self,
        vector: &[f32],
        k: usize,
        search_k: usize,
        spill: usize,
    ) -> Result<ResultSet, BackendError> {
        let spill = spill.min(self.dimensions - 1);
        let mut counts = CountingBitmap::new(self.nbasis);
        let mut dots = vec![0.0f32; self.dimensions];
        let mut maxes = vec![0i32; spill + 1];
        for (basis, bm) in self.bases.iter().zip(&self.bms) {
            find_indexes_for_basis(vector, basis, &mut dots, &mut maxes);
            let mut probed = RoaringBitmap::new();
            for &m in maxes.iter() {
                probed |= bm.get(m);
            }
            counts.or(probed);
        }

        let results = ResultSet::new(k);
        for id in counts.top_k(search_k).iter() {
            let sim = self.backend.compute_similarity(vector, id as ID)?;
            results.add_result(id as ID, sim);
        }
        Ok(results)
    }

    /// Persists the basis set (token-guarded) and every touched partition
    /// bitmap. A no-op for backends without index persistence. Idempotent;
    /// callers may retry after an I/O error.
    pub fn sync(&mut self) -> Result<(), BackendError> {
        let token = self.bases_token;
        let bases = &self.bases;
        let bms = &self.bms;
        let backend = match self.backend.as_index_backend() {
            Some(backend) => backend,
            None => return Ok(()),
        };
        backend.save_bases(bases, token)?;
        for (n, bm) in bms.iter().enumerate() {
            for (slot, bitmap) in bm.partitions.iter().enumerate() {
                if bm.touched[slot] || !bitmap.is_empty() {
                    backend.save_bitmap(n, PartitionMap::index_for_slot(slot), bitmap)?;
                }
            }
        }
        backend.sync()
    }

    /// Legacy entry point: sync, then let the backend compile itself if it
    /// advertises that capability. Safe to call repeatedly.
    pub fn build_index(&mut self) -> Result<(), BackendError> {
        self.sync()?;
        if let Some(backend) = self.backend.as_compiling() {
            info!("compiling backend");
            backend.compile()?;
            info!("completed compilation");
        }
        Ok(())
    }

    /// Syncs and closes the backend.
    pub fn close(mut self) -> Result<(), BackendError> {
        self.sync()?;
        self.backend.close()
    }

    fn make_basis(&mut self) {
        info!(nbasis = self.nbasis, dimensions = self.dimensions, "generating basis set");
        let mut bases = Vec::with_capacity(self.nbasis);
        for n in 0..self.nbasis {
            let mut basis: Basis = (0..self.dimensions).map(|_| self.random_vector()).collect();
            normalize_inplace(&mut basis[0]);
            // A single Gram-Schmidt pass is numerically insufficient in
            // double-digit dimensions; ten passes leave a comfortable margin.
            for _ in 0..10 {
                orthonormalize(&mut basis);
            }
            debug!(basis = n, "completed basis");
            bases.push(basis);
        }
        self.bases = bases;
        info!("completed basis set generation");
    }

    fn random_vector(&mut self) -> Vector {
        (0..self.dimensions)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect()
    }

    fn remove_from_bitmaps(&mut self, id: ID) {
        for bm in self.bms.iter_mut() {
            bm.remove_everywhere(id as u32);
        }
    }

    fn add_to_bitmaps<T: AsRef<[f32]> + Sync>(&mut self, ids: &[ID], vectors: &[T]) {
        let dimensions = self.dimensions;
        let pre_spill = self.pre_spill;
        let bases = &self.bases;
        self.bms.par_iter_mut().enumerate().for_each(|(n, bm)| {
            let basis = &bases[n];
            let mut dots = vec![0.0f32; dimensions];
            let mut maxes = vec![0i32; pre_spill];
            for (&id, vector) in ids.iter().zip(vectors) {
                find_indexes_for_basis(vector.as_ref(), basis, &mut dots, &mut maxes);
                for &m in maxes.iter() {
                    bm.insert(m, id as u32);
                }
            }
        });
    }

    fn load_from_backend(&mut self) -> Result<(), BackendError> {
        let dimensions = self.dimensions;
        let requested = self.nbasis;
        let (bases, bms) = {
            let backend = self
                .backend
                .as_index_backend()
                .ok_or(BackendError::IncompatibleBackend("index persistence"))?;
            let bases = backend.load_bases()?;
            if bases.len() != requested {
                debug!(
                    stored = bases.len(),
                    requested, "stored basis count differs; using stored bases"
                );
            }
            let mut bms = Vec::with_capacity(bases.len());
            for n in 0..bases.len() {
                let mut bm = PartitionMap::new(dimensions);
                for axis in 1..=dimensions as i32 {
                    if let Some(bitmap) = backend.load_bitmap(n, axis)? {
                        bm.set(axis, bitmap);
                    }
                    if let Some(bitmap) = backend.load_bitmap(n, -axis)? {
                        bm.set(-axis, bitmap);
                    }
                }
                bms.push(bm);
            }
            (bases, bms)
        };
        self.nbasis = bases.len();
        self.bases = bases;
        self.bms = bms;
        self.bases_token = 1;
        Ok(())
    }
}

/// One pass of modified Gram-Schmidt over `basis`, in place.
fn orthonormalize(basis: &mut [Vector]) {
    for i in 1..basis.len() {
        let (head, tail) = basis.split_at_mut(i);
        let cur = &head[i - 1];
        for vector in tail.iter_mut() {
            let d = dot(vector, cur);
            for (x, c) in vector.iter_mut().zip(cur) {
                *x -= d * c;
            }
            normalize_inplace(vector);
        }
    }
}

/// Fills `maxes` with distinct signed axes of `basis`, ordered by
/// descending projection magnitude of `target`. Consumes `dots` as
/// scratch; each chosen axis is zeroed so the next round picks the
/// runner-up.
fn find_indexes_for_basis(target: &[f32], basis: &Basis, dots: &mut [f32], maxes: &mut [i32]) {
    for (slot, basis_vector) in dots.iter_mut().zip(basis) {
        *slot = dot(basis_vector, target);
    }
    for m in maxes.iter_mut() {
        let big = argmax(dots);
        let small = argmin(dots);
        let idx = if dots[big].abs() >= dots[small].abs() {
            big
        } else {
            small
        };
        *m = if dots[idx] > 0.0 {
            (idx + 1) as i32
        } else {
            -((idx + 1) as i32)
        };
        dots[idx] = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::backend::full_table_scan_search;
    use crate::backend_disk::DiskBackend;
    use crate::backend_memory::MemoryBackend;
    use crate::quantization::NoQuantization;
    use crate::utils::random_unit_vectors;

    fn identity_basis(dimensions: usize) -> Basis {
        (0..dimensions)
            .map(|i| {
                let mut v = vec![0.0f32; dimensions];
                v[i] = 1.0;
                v
            })
            .collect()
    }

    fn assert_orthonormal(basis: &Basis) {
        for (i, a) in basis.iter().enumerate() {
            assert!(
                (bbq_distance::norm(a) - 1.0).abs() <= 1e-4,
                "basis vector {} has norm {}",
                i,
                bbq_distance::norm(a)
            );
            for (j, b) in basis.iter().enumerate().skip(i + 1) {
                let d = dot(a, b);
                assert!(d.abs() <= 1e-3, "⟨b_{}, b_{}⟩ = {}", i, j, d);
            }
        }
    }

    #[test]
    fn test_identity_basis_partition_placement() {
        let mut store = VectorStore::with_seed(MemoryBackend::new(4), 1, 1, 7).unwrap();
        store.bases = vec![identity_basis(4)];

        store.add_vector(7, &[0.9, 0.1, 0.0, 0.0]).unwrap();
        assert!(store.bms[0].get(1).contains(7));
        for index in [-1, 2, -2, 3, -3, 4, -4] {
            assert!(store.bms[0].get(index).is_empty(), "partition {}", index);
        }

        store.add_vector(8, &[-0.9, 0.1, 0.0, 0.0]).unwrap();
        assert!(store.bms[0].get(-1).contains(8));
        assert!(store.bms[0].get(1).contains(7));
        assert!(!store.bms[0].get(1).contains(8));
    }

    #[test]
    fn test_overwrite_moves_partitions() {
        let mut store = VectorStore::with_seed(MemoryBackend::new(4), 1, 1, 7).unwrap();
        store.bases = vec![identity_basis(4)];

        store.add_vector(7, &[0.9, 0.1, 0.0, 0.0]).unwrap();
        store.add_vector(7, &[0.0, 0.0, -0.8, 0.1]).unwrap();

        assert!(!store.bms[0].get(1).contains(7));
        assert!(store.bms[0].get(-3).contains(7));
        let sim = store.backend.compute_similarity(&[0.0, 0.0, -1.0, 0.0], 7).unwrap();
        assert!(sim > 0.99);
    }

    #[test]
    fn test_each_id_lands_in_pre_spill_partitions() {
        let dim = 8;
        let vecs = random_unit_vectors(50, dim, 42);
        let mut store = VectorStore::with_seed(MemoryBackend::new(dim), 3, 2, 9).unwrap();
        store.add_vectors_with_offset(0, &vecs).unwrap();

        for bm in &store.bms {
            for id in 0..vecs.len() as u32 {
                let occurrences = bm
                    .partitions
                    .iter()
                    .filter(|bitmap| bitmap.contains(id))
                    .count();
                assert_eq!(occurrences, 2, "id {} in {} partitions", id, occurrences);
            }
        }
    }

    #[test]
    fn test_make_basis_is_orthonormal() {
        let store = VectorStore::with_seed(MemoryBackend::new(24), 4, 1, 42).unwrap();
        assert_eq!(store.bases.len(), 4);
        for basis in &store.bases {
            assert_eq!(basis.len(), 24);
            assert_orthonormal(basis);
        }
    }

    #[test]
    fn test_find_nearest_self_query() {
        let dim = 8;
        let vecs = random_unit_vectors(100, dim, 42);
        let mut store = VectorStore::with_seed(MemoryBackend::new(dim), 4, 1, 17).unwrap();
        for (i, v) in vecs.iter().enumerate() {
            store.add_vector(i as ID, v).unwrap();
        }

        let results = store.find_nearest(&vecs[42], 1, 100, 0).unwrap();
        let got = results.to_vec();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 42);
        assert!((got[0].similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_full_fanout_recall_is_exact() {
        let dim = 8;
        let n = 60;
        let vecs = random_unit_vectors(n, dim, 42);
        let mut store = VectorStore::with_seed(MemoryBackend::new(dim), 16, 1, 1234).unwrap();
        store.add_vectors_with_offset(0, &vecs).unwrap();

        let target = random_unit_vectors(1, dim, 7).remove(0);
        let approx = store.find_nearest(&target, 10, n, dim - 1).unwrap();
        let exact = full_table_scan_search(store.backend(), &target, 10).unwrap();
        let recall = approx.compute_recall(&exact, 10);
        assert_eq!(recall, 1.0, "approx {:?} exact {:?}", approx.to_vec(), exact.to_vec());
    }

    #[test]
    fn test_bulk_add_matches_sequential() {
        let dim = 8;
        let vecs = random_unit_vectors(40, dim, 5);

        let mut one = VectorStore::with_seed(MemoryBackend::new(dim), 3, 1, 99).unwrap();
        for (i, v) in vecs.iter().enumerate() {
            one.add_vector(i as ID, v).unwrap();
        }

        let mut bulk = VectorStore::with_seed(MemoryBackend::new(dim), 3, 1, 99).unwrap();
        bulk.add_vectors_with_offset(0, &vecs).unwrap();

        for (a, b) in one.bms.iter().zip(&bulk.bms) {
            assert_eq!(a.partitions, b.partitions);
        }
    }

    #[test]
    fn test_pre_spill_and_spill_clamping() {
        let store = VectorStore::with_seed(MemoryBackend::new(4), 2, 0, 1).unwrap();
        assert_eq!(store.pre_spill, 1);
        let store = VectorStore::with_seed(MemoryBackend::new(4), 2, 99, 1).unwrap();
        assert_eq!(store.pre_spill, 4);

        // An over-large query spill is clamped rather than rejected.
        let results = store.find_nearest(&[1.0, 0.0, 0.0, 0.0], 3, 10, 1000).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_signed_axis_selection_order_and_ties() {
        let basis = identity_basis(4);
        let mut dots = vec![0.0f32; 4];
        let mut maxes = vec![0i32; 3];
        find_indexes_for_basis(&[0.1, -0.9, 0.5, -0.5], &basis, &mut dots, &mut maxes);
        // Descending magnitude; the +0.5/-0.5 tie goes to the argmax (the
        // positive entry at the lower axis index).
        assert_eq!(maxes, vec![-2, 3, -4]);
    }

    #[test]
    fn test_put_error_leaves_partitions_untouched() {
        let mut store = VectorStore::with_seed(MemoryBackend::new(4), 2, 1, 3).unwrap();
        let err = store.add_vector(0, &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, BackendError::DimensionMismatch { .. }));
        for bm in &store.bms {
            assert!(bm.partitions.iter().all(|bitmap| bitmap.is_empty()));
        }
    }

    #[test]
    fn test_disk_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let dim = 8;
        let vecs = random_unit_vectors(64, dim, 21);
        let target = random_unit_vectors(1, dim, 77).remove(0);

        let backend = DiskBackend::new(dir.path(), dim, NoQuantization).unwrap();
        let mut store = VectorStore::with_seed(backend, 4, 1, 123).unwrap();
        store.add_vectors_with_offset(0, &vecs).unwrap();
        store.sync().unwrap();
        let before: Vec<_> = store.find_nearest(&target, 10, 64, 2).unwrap().to_vec();
        store.close().unwrap();

        let backend = DiskBackend::new(dir.path(), dim, NoQuantization).unwrap();
        assert!(backend.info().has_index_data);
        let store = VectorStore::new(backend, 4, 1).unwrap();
        let after: Vec<_> = store.find_nearest(&target, 10, 64, 2).unwrap().to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn test_empty_store_query() {
        let store = VectorStore::with_seed(MemoryBackend::new(4), 2, 1, 1).unwrap();
        let results = store.find_nearest(&[1.0, 0.0, 0.0, 0.0], 5, 10, 1).unwrap();
        assert!(results.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Every generated basis is orthonormal within tolerance.
        #[test]
        fn prop_basis_orthonormality(dimensions in 2usize..24, seed in 0u64..1000) {
            let store =
                VectorStore::with_seed(MemoryBackend::new(dimensions), 1, 1, seed).unwrap();
            for (i, a) in store.bases[0].iter().enumerate() {
                prop_assert!((bbq_distance::norm(a) - 1.0).abs() <= 1e-4);
                for b in store.bases[0].iter().skip(i + 1) {
                    prop_assert!(dot(a, b).abs() <= 1e-3);
                }
            }
        }
    }
}

//! Storage backends and their capability surface.
//!
//! Every backend stores vectors and scores a query against a stored id
//! under its own quantization. Optional capabilities (scanning, direct
//! access to the lowered form, index persistence, post-load compilation)
//! are separate traits, probed through the default-`None` accessors on
//! [`VectorBackend`] rather than downcasts, so callers degrade gracefully
//! on backends that lack them.

use roaring::RoaringBitmap;

use crate::result::ResultSet;
use crate::types::{BackendError, BackendInfo, Basis, ID};

pub trait VectorBackend {
    /// Stores `vector` under `id`. Idempotent for identical payloads;
    /// replaces any previous value otherwise.
    fn put_vector(&mut self, id: ID, vector: &[f32]) -> Result<(), BackendError>;

    /// Similarity of `query` to the stored vector at `id`, under the
    /// backend's quantization.
    fn compute_similarity(&self, query: &[f32], id: ID) -> Result<f32, BackendError>;

    fn info(&self) -> BackendInfo;

    fn exists(&self, id: ID) -> bool;

    /// Flushes and releases resources. The backend must not be used after.
    fn close(&mut self) -> Result<(), BackendError>;

    fn as_scannable(&self) -> Option<&dyn ScannableBackend> {
        None
    }

    fn as_index_backend(&mut self) -> Option<&mut dyn IndexBackend> {
        None
    }

    fn as_compiling(&mut self) -> Option<&mut dyn CompilingBackend> {
        None
    }
}

/// Backends that can enumerate their populated ids.
pub trait ScannableBackend: VectorBackend {
    /// Visits stored ids in ascending order, skipping holes. The first
    /// callback error aborts the scan and is returned.
    fn for_each_id(
        &self,
        f: &mut dyn FnMut(ID) -> Result<(), BackendError>,
    ) -> Result<(), BackendError>;
}

/// Backends that expose the stored lowered form directly.
pub trait VectorGetter<L> {
    fn get_vector(&self, id: ID) -> Result<L, BackendError>;
}

/// Backends that persist the index itself (bases and partition bitmaps)
/// alongside the vectors.
pub trait IndexBackend {
    /// Persists the basis set atomically. `token` makes the write
    /// idempotent: when it equals the token of the last persisted write the
    /// implementation skips the write and returns it unchanged.
    fn save_bases(&mut self, bases: &[Basis], token: u64) -> Result<u64, BackendError>;

    fn load_bases(&self) -> Result<Vec<Basis>, BackendError>;

    /// Atomically replaces the id set for one `(basis, signed axis)` cell.
    fn save_bitmap(
        &mut self,
        basis: usize,
        index: i32,
        bitmap: &RoaringBitmap,
    ) -> Result<(), BackendError>;

    /// Loads one cell; `Ok(None)` when it was never persisted.
    fn load_bitmap(&self, basis: usize, index: i32) -> Result<Option<RoaringBitmap>, BackendError>;

    /// Flushes persisted state to durable storage.
    fn sync(&mut self) -> Result<(), BackendError>;
}

/// Backends that run a one-time compaction step after bulk loading.
pub trait CompilingBackend {
    fn compile(&mut self) -> Result<(), BackendError>;
}

/// Exact search: scores every stored vector against `target`. Ground truth
/// for recall measurements.
pub fn full_table_scan_search<B: VectorBackend + ?Sized>(
    backend: &B,
    target: &[f32],
    k: usize,
) -> Result<ResultSet, BackendError> {
    let scannable = backend
        .as_scannable()
        .ok_or(BackendError::IncompatibleBackend("full scans"))?;
    let results = ResultSet::new(k);
    scannable.for_each_id(&mut |id| {
        let sim = scannable.compute_similarity(target, id)?;
        results.add_result(id, sim);
        Ok(())
    })?;
    Ok(results)
}

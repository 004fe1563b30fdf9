//! Full-precision in-memory backend: a sparse array of vectors indexed by
//! id, with holes for ids that were never stored.

use crate::backend::{ScannableBackend, VectorBackend, VectorGetter};
use crate::types::{BackendError, BackendInfo, Vector, ID};

pub struct MemoryBackend {
    vecs: Vec<Option<Vector>>,
    dimensions: usize,
}

impl MemoryBackend {
    pub fn new(dimensions: usize) -> Self {
        MemoryBackend {
            vecs: Vec::new(),
            dimensions,
        }
    }
}

impl VectorBackend for MemoryBackend {
    fn put_vector(&mut self, id: ID, vector: &[f32]) -> Result<(), BackendError> {
        if vector.len() != self.dimensions {
            return Err(BackendError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let slot = id as usize;
        if slot >= self.vecs.len() {
            self.vecs.resize_with(slot + 1, || None);
        }
        self.vecs[slot] = Some(vector.to_vec());
        Ok(())
    }

    fn compute_similarity(&self, query: &[f32], id: ID) -> Result<f32, BackendError> {
        let target = self
            .vecs
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(BackendError::IdNotFound)?;
        Ok(bbq_distance::cosine_similarity(target, query))
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            has_index_data: false,
            dimensions: self.dimensions,
            quantization: "none".to_string(),
        }
    }

    fn exists(&self, id: ID) -> bool {
        self.vecs
            .get(id as usize)
            .map(Option::is_some)
            .unwrap_or(false)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn as_scannable(&self) -> Option<&dyn ScannableBackend> {
        Some(self)
    }
}

impl ScannableBackend for MemoryBackend {
    fn for_each_id(
        &self,
        f: &mut dyn FnMut(ID) -> Result<(), BackendError>,
    ) -> Result<(), BackendError> {
        for (id, v) in self.vecs.iter().enumerate() {
            if v.is_some() {
                f(id as ID)?;
            }
        }
        Ok(())
    }
}

impl VectorGetter<Vector> for MemoryBackend {
    fn get_vector(&self, id: ID) -> Result<Vector, BackendError> {
        self.vecs
            .get(id as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(BackendError::IdNotFound)
    }
}

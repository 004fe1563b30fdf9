//! In-memory backend that stores the quantizer's lowered form instead of
//! the full-precision vector. Same sparse-array shape as `MemoryBackend`;
//! queries are lowered once and scored with the quantizer's similarity.

use crate::backend::{ScannableBackend, VectorBackend, VectorGetter};
use crate::quantization::Quantization;
use crate::types::{BackendError, BackendInfo, ID};

pub struct QuantizedMemoryBackend<Q: Quantization> {
    vecs: Vec<Option<Q::Lowered>>,
    dimensions: usize,
    quantization: Q,
}

impl<Q: Quantization> QuantizedMemoryBackend<Q> {
    pub fn new(dimensions: usize, quantization: Q) -> Self {
        QuantizedMemoryBackend {
            vecs: Vec::new(),
            dimensions,
            quantization,
        }
    }
}

impl<Q: Quantization> VectorBackend for QuantizedMemoryBackend<Q> {
    fn put_vector(&mut self, id: ID, vector: &[f32]) -> Result<(), BackendError> {
        if vector.len() != self.dimensions {
            return Err(BackendError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let lowered = self.quantization.lower(vector)?;
        let slot = id as usize;
        if slot >= self.vecs.len() {
            self.vecs.resize_with(slot + 1, || None);
        }
        self.vecs[slot] = Some(lowered);
        Ok(())
    }

    fn compute_similarity(&self, query: &[f32], id: ID) -> Result<f32, BackendError> {
        let lowered = self.quantization.lower(query)?;
        let target = self
            .vecs
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(BackendError::IdNotFound)?;
        Ok(self.quantization.similarity(target, &lowered))
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            has_index_data: false,
            dimensions: self.dimensions,
            quantization: self.quantization.name().to_string(),
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

impl<Q: Quantization> ScannableBackend for QuantizedMemoryBackend<Q> {
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

impl<Q: Quantization> VectorGetter<Q::Lowered> for QuantizedMemoryBackend<Q> {
    fn get_vector(&self, id: ID) -> Result<Q::Lowered, BackendError> {
        self.vecs
            .get(id as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(BackendError::IdNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::full_table_scan_search;
    use crate::backend_memory::MemoryBackend;
    use crate::quantization::Float16Quantization;
    use crate::utils::random_unit_vectors;

    #[test]
    fn test_float16_tracks_full_precision_scan() {
        let dim = 32;
        let vecs = random_unit_vectors(500, dim, 42);

        let mut mem = MemoryBackend::new(dim);
        let mut quant = QuantizedMemoryBackend::new(dim, Float16Quantization);
        for (i, v) in vecs.iter().enumerate() {
            mem.put_vector(i as ID, v).unwrap();
            quant.put_vector(i as ID, v).unwrap();
        }

        let target = random_unit_vectors(1, dim, 7).remove(0);
        let exact = full_table_scan_search(&mem, &target, 20).unwrap();
        let approx = full_table_scan_search(&quant, &target, 20).unwrap();
        let recall = approx.compute_recall(&exact, 10);
        assert!(recall >= 0.9, "float16 recall {} too low", recall);
    }

    #[test]
    fn test_get_vector_returns_lowered_form() {
        let mut be = QuantizedMemoryBackend::new(2, Float16Quantization);
        be.put_vector(1, &[0.5, -0.25]).unwrap();
        let lowered = be.get_vector(1).unwrap();
        assert_eq!(lowered.len(), 2);
        assert!((lowered[0].to_f32() - 0.5).abs() < 1e-3);
        assert!(matches!(be.get_vector(0), Err(BackendError::IdNotFound)));
    }
}

//! Lowered vector representations for storage backends.
//!
//! A quantizer maps a full-precision vector to a compact lowered form `L`,
//! scores two lowered values against each other, and round-trips `L`
//! through a fixed-width little-endian byte encoding. The similarity only
//! needs to preserve cosine ranking well enough for the index's recall
//! target; it does not need to be exactly cosine.

mod float16;

pub use float16::Float16Quantization;

use crate::types::{QuantizationError, Vector};

pub trait Quantization {
    type Lowered: Clone;

    /// Lowers a well-formed (finite, nonzero) vector. Fails only on
    /// malformed input.
    fn lower(&self, vector: &[f32]) -> Result<Self::Lowered, QuantizationError>;

    /// Encoded width in bytes for a given dimensionality. Constant per `d`.
    fn lower_size(&self, dimensions: usize) -> usize;

    /// Similarity of two lowered values, approximating cosine.
    fn similarity(&self, x: &Self::Lowered, y: &Self::Lowered) -> f32;

    /// Writes exactly `lower_size(d)` little-endian bytes into `buf`.
    fn marshal(&self, buf: &mut [u8], x: &Self::Lowered) -> Result<(), QuantizationError>;

    /// Inverse of `marshal`; `data` must be exactly `lower_size(d)` bytes.
    fn unmarshal(&self, data: &[u8]) -> Result<Self::Lowered, QuantizationError>;

    /// Stable identifier persisted in backend metadata.
    fn name(&self) -> &'static str;
}

/// Identity quantization: the lowered form is the vector itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoQuantization;

impl Quantization for NoQuantization {
    type Lowered = Vector;

    fn lower(&self, vector: &[f32]) -> Result<Vector, QuantizationError> {
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(QuantizationError::BadVector("non-finite component"));
        }
        Ok(vector.to_vec())
    }

    fn lower_size(&self, dimensions: usize) -> usize {
        4 * dimensions
    }

    fn similarity(&self, x: &Vector, y: &Vector) -> f32 {
        bbq_distance::cosine_similarity(x, y)
    }

    fn marshal(&self, buf: &mut [u8], x: &Vector) -> Result<(), QuantizationError> {
        if buf.len() != 4 * x.len() {
            return Err(QuantizationError::BadBufferLength {
                expected: 4 * x.len(),
                actual: buf.len(),
            });
        }
        for (chunk, v) in buf.chunks_exact_mut(4).zip(x) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Vector, QuantizationError> {
        if data.len() % 4 != 0 {
            return Err(QuantizationError::BadBufferLength {
                expected: data.len() / 4 * 4,
                actual: data.len(),
            });
        }
        let mut out = Vec::with_capacity(data.len() / 4);
        for chunk in data.chunks_exact(4) {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(chunk);
            out.push(f32::from_le_bytes(bytes));
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_identity_round_trip_bit_exact() {
        let q = NoQuantization;
        let mut rng = StdRng::seed_from_u64(42);
        let v: Vector = (0..33).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let lowered = q.lower(&v).unwrap();
        assert_eq!(lowered, v);

        let mut buf = vec![0u8; q.lower_size(v.len())];
        q.marshal(&mut buf, &lowered).unwrap();
        let restored = q.unmarshal(&buf).unwrap();
        assert_eq!(restored, lowered);
    }

    #[test]
    fn test_identity_similarity_is_cosine() {
        let q = NoQuantization;
        let x = vec![1.0, 0.0, 0.0];
        let y = vec![0.0, 1.0, 0.0];
        assert!(q.similarity(&x, &x) > 0.999);
        assert!(q.similarity(&x, &y).abs() < 1e-6);
    }

    #[test]
    fn test_identity_rejects_non_finite() {
        let q = NoQuantization;
        assert!(q.lower(&[0.0, f32::NAN]).is_err());
        assert!(q.lower(&[f32::INFINITY, 1.0]).is_err());
    }

    #[test]
    fn test_identity_marshal_checks_length() {
        let q = NoQuantization;
        let v = vec![1.0f32, 2.0];
        let mut short = vec![0u8; 7];
        assert!(q.marshal(&mut short, &v).is_err());
    }
}

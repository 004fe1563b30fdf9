//! Half-precision quantization: halves the stored footprint, scores by
//! widening both sides back to f32.

use half::f16;

use super::Quantization;
use crate::types::QuantizationError;

#[derive(Clone, Copy, Debug, Default)]
pub struct Float16Quantization;

impl Quantization for Float16Quantization {
    type Lowered = Vec<f16>;

    fn lower(&self, vector: &[f32]) -> Result<Vec<f16>, QuantizationError> {
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(QuantizationError::BadVector("non-finite component"));
        }
        Ok(vector.iter().map(|&x| f16::from_f32(x)).collect())
    }

    fn lower_size(&self, dimensions: usize) -> usize {
        2 * dimensions
    }

    fn similarity(&self, x: &Vec<f16>, y: &Vec<f16>) -> f32 {
        let wide_x: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
        let wide_y: Vec<f32> = y.iter().map(|v| v.to_f32()).collect();
        bbq_distance::cosine_similarity(&wide_x, &wide_y)
    }

    fn marshal(&self, buf: &mut [u8], x: &Vec<f16>) -> Result<(), QuantizationError> {
        if buf.len() != 2 * x.len() {
            return Err(QuantizationError::BadBufferLength {
                expected: 2 * x.len(),
                actual: buf.len(),
            });
        }
        for (chunk, v) in buf.chunks_exact_mut(2).zip(x) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Vec<f16>, QuantizationError> {
        if data.len() % 2 != 0 {
            return Err(QuantizationError::BadBufferLength {
                expected: data.len() / 2 * 2,
                actual: data.len(),
            });
        }
        Ok(data
            .chunks_exact(2)
            .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    fn name(&self) -> &'static str {
        "float16"
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::quantization::NoQuantization;

    #[test]
    fn test_round_trip() {
        let q = Float16Quantization;
        let mut rng = StdRng::seed_from_u64(42);
        let v: Vec<f32> = (0..64).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let lowered = q.lower(&v).unwrap();
        let mut buf = vec![0u8; q.lower_size(v.len())];
        q.marshal(&mut buf, &lowered).unwrap();
        let restored = q.unmarshal(&buf).unwrap();
        assert_eq!(restored, lowered);

        // Widening back stays within half precision of the input.
        for (orig, low) in v.iter().zip(&restored) {
            assert!((orig - low.to_f32()).abs() < 1e-3);
        }
    }

    #[test]
    fn test_similarity_tracks_cosine() {
        let full = NoQuantization;
        let q = Float16Quantization;
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..16 {
            let a: Vec<f32> =
                bbq_distance::normalize(&(0..32).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<_>>());
            let b: Vec<f32> =
                bbq_distance::normalize(&(0..32).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<_>>());
            let exact = full.similarity(&a, &b);
            let approx = q.similarity(&q.lower(&a).unwrap(), &q.lower(&b).unwrap());
            assert!(
                (exact - approx).abs() < 1e-3,
                "exact {} vs float16 {}",
                exact,
                approx
            );
        }
    }

    #[test]
    fn test_unmarshal_rejects_odd_length() {
        let q = Float16Quantization;
        assert!(q.unmarshal(&[0u8, 1, 2]).is_err());
    }
}

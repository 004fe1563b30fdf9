//! Vector primitives for unit-norm embeddings: dot products, cosine
//! similarity, normalization, extrema, and plane projection.
//!
//! The hot-path kernels go through `simsimd`, which dispatches to the best
//! SIMD implementation for the running CPU. `scalar` holds portable
//! reference kernels used as ground truth in tests.

pub mod scalar;

use simsimd::SpatialSimilarity;

/// Inner product `⟨a, b⟩`. Inputs must have equal length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    f32::dot(a, b).unwrap_or(0.0) as f32
}

/// L2 norm `‖v‖`.
pub fn norm(v: &[f32]) -> f32 {
    (f32::dot(v, v).unwrap_or(0.0) as f32).sqrt()
}

/// Cosine similarity `⟨a, b⟩ / (‖a‖ · ‖b‖)`. For unit-norm inputs this is
/// just the inner product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b) / (norm(a) * norm(b)).max(f32::EPSILON)
}

/// Returns a unit-norm copy of `vector`.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    vector.iter().map(|x| x / (norm + 1e-32)).collect()
}

/// Divides `vector` by its L2 norm in place.
pub fn normalize_inplace(vector: &mut [f32]) {
    let factor = norm(vector) + 1e-32;
    for x in vector.iter_mut() {
        *x /= factor;
    }
}

/// Index of the largest element. The lowest index wins ties.
pub fn argmax(v: &[f32]) -> usize {
    debug_assert!(!v.is_empty());
    let mut best = 0;
    for (i, &x) in v.iter().enumerate().skip(1) {
        if x > v[best] {
            best = i;
        }
    }
    best
}

/// Index of the smallest element. The lowest index wins ties.
pub fn argmin(v: &[f32]) -> usize {
    debug_assert!(!v.is_empty());
    let mut best = 0;
    for (i, &x) in v.iter().enumerate().skip(1) {
        if x < v[best] {
            best = i;
        }
    }
    best
}

/// Projects `v` onto the hyperplane with unit normal `normal`
/// (`v ← v − ⟨v,n⟩·n`), then renormalizes `v`.
pub fn project_to_plane(v: &mut [f32], normal: &[f32]) {
    let d = dot(v, normal);
    for (x, n) in v.iter_mut().zip(normal) {
        *x -= d * n;
    }
    normalize_inplace(v);
}

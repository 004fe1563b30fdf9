#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::{Rng, SeedableRng};

#[cfg(test)]
pub(crate) fn random_unit_vectors(n: usize, dimensions: usize, seed: u64) -> Vec<crate::Vector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let v: Vec<f32> = (0..dimensions)
                .map(|_| rng.sample::<f32, _>(rand_distr::StandardNormal))
                .collect();
            bbq_distance::normalize(&v)
        })
        .collect()
}

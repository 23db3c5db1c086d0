//! Parameter initialization.
use cortex_core::Blob;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

/// Generator for a layer: reproducible when seeded, from entropy otherwise.
pub(crate) fn generator(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Fills `blob` with elements drawn from *U(low, high)*.
///
/// # Panics
///
/// If `low` >= `high`.
pub fn uniform<R: Rng>(blob: &mut Blob, low: f32, high: f32, rng: &mut R) {
    let distribution = Uniform::new(low, high);
    blob.data_mut()
        .map_inplace(|el| *el = distribution.sample(rng));
}

#[cfg(test)]
mod test {
    use cortex_core::{Blob, BlobDesc};

    use super::*;

    #[test]
    fn bounded_and_reproducible() {
        let desc = BlobDesc::channels_only(64);
        let (mut first, mut second) = (Blob::zeros(desc), Blob::zeros(desc));
        uniform(&mut first, -0.5, 0.5, &mut generator(Some(7)));
        uniform(&mut second, -0.5, 0.5, &mut generator(Some(7)));

        assert_eq!(first, second);
        assert!(first.data().iter().all(|el| (-0.5..0.5).contains(el)));
    }
}

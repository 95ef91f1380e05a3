//! # Channel mixing transforms
//!
//! Reference implementations of the [`MixingTransform`] contract:
//! - [`OrthogonalMixing`]: a random orthogonal channel matrix. Inverse is
//!   the transpose and `|det| = 1`, so the transform is volume-preserving
//!   and exactly invertible with no linear solve.
//! - [`PermutationMixing`]: a channel permutation, invertible by
//!   construction and parameter-free.
//!
//! Both act independently at every batch/spatial position, i.e. as a 1x1
//! convolution over channels.

use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::MixingTransform;
use crate::error::{FlowError, Result};
use crate::tensor::{channels, from_channel_matrix, to_channel_matrix, Tensor, CHANNEL_AXIS};

/// Volume-preserving channel mixing by a random orthogonal matrix
///
/// `weight` must stay orthogonal: `inverse` multiplies by the transpose.
/// An external optimizer updating it is responsible for re-projecting
/// onto the orthogonal group (or for going through [`set_weight`], which
/// validates).
///
/// [`set_weight`]: OrthogonalMixing::set_weight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrthogonalMixing {
    channels: usize,
    weight: Array2<f64>,
}

impl OrthogonalMixing {
    /// Random orthogonal mixing over `channels` channels
    pub fn new(channels: usize) -> Self {
        Self::with_rng(channels, &mut rand::thread_rng())
    }

    /// Random orthogonal mixing drawn from the given generator
    pub fn with_rng<R: Rng>(channels: usize, rng: &mut R) -> Self {
        let weight = random_orthogonal(channels, rng);
        debug!(channels, "initialized orthogonal channel mixing");
        Self { channels, weight }
    }

    /// The mixing matrix
    pub fn weight(&self) -> &Array2<f64> {
        &self.weight
    }

    /// Replace the mixing matrix, validating shape and orthogonality
    pub fn set_weight(&mut self, weight: Array2<f64>) -> Result<()> {
        if weight.nrows() != self.channels || weight.ncols() != self.channels {
            return Err(FlowError::Dimension(format!(
                "mixing weight must be {c}x{c}, got {}x{}",
                weight.nrows(),
                weight.ncols(),
                c = self.channels
            )));
        }
        let gram = weight.t().dot(&weight);
        let max_dev = gram
            .indexed_iter()
            .map(|((i, j), &v)| (v - if i == j { 1.0 } else { 0.0 }).abs())
            .fold(0.0f64, f64::max);
        if max_dev > 1e-8 {
            return Err(FlowError::Configuration(format!(
                "mixing weight is not orthogonal (max deviation {max_dev:.2e})"
            )));
        }
        self.weight = weight;
        Ok(())
    }

    fn check_channels(&self, x: &Tensor) -> Result<()> {
        if channels(x) != self.channels {
            return Err(FlowError::Dimension(format!(
                "mixing expects {} channels, tensor has {}",
                self.channels,
                channels(x)
            )));
        }
        Ok(())
    }

    /// Apply an arbitrary channel matrix at every position
    fn apply(&self, w: &Array2<f64>, x: &Tensor) -> Result<Tensor> {
        self.check_channels(x)?;
        let m = to_channel_matrix(x);
        Ok(from_channel_matrix(&w.dot(&m), x.shape()))
    }
}

impl MixingTransform for OrthogonalMixing {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.apply(&self.weight, x)
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.apply(&self.weight.t().to_owned(), y)
    }

    fn forward_adjoint(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)> {
        // VJP of the transpose map is the matrix itself
        Ok((self.forward(dx)?, self.forward(x)?))
    }

    fn inverse_adjoint(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.inverse(dy)?, self.inverse(y)?))
    }

    fn jacobian(&self, dx: &Tensor, dtheta: &[f64], x: &Tensor) -> Result<(Tensor, Tensor)> {
        let y = self.forward(x)?;
        let mut dy = self.forward(dx)?;
        if !dtheta.is_empty() {
            if dtheta.len() != self.num_params() {
                return Err(FlowError::Dimension(format!(
                    "mixing parameter direction has {} entries, expected {}",
                    dtheta.len(),
                    self.num_params()
                )));
            }
            let dw = Array2::from_shape_vec((self.channels, self.channels), dtheta.to_vec())
                .expect("length checked above");
            dy = dy + self.apply(&dw, x)?;
        }
        Ok((dy, y))
    }

    fn num_params(&self) -> usize {
        self.channels * self.channels
    }

    fn params(&self) -> Vec<f64> {
        self.weight.iter().copied().collect()
    }
}

/// Random orthogonal matrix by Gram-Schmidt on a Gaussian draw
fn random_orthogonal<R: Rng>(n: usize, rng: &mut R) -> Array2<f64> {
    let mut q: Array2<f64> = Array2::random_using((n, n), StandardNormal, rng);

    for i in 0..n {
        let norm: f64 = q.column(i).mapv(|x| x * x).sum().sqrt();
        if norm > 1e-10 {
            q.column_mut(i).mapv_inplace(|x| x / norm);
        }

        for j in (i + 1)..n {
            let dot: f64 = q
                .column(i)
                .iter()
                .zip(q.column(j).iter())
                .map(|(a, b)| a * b)
                .sum();
            let col_i = q.column(i).to_owned();
            q.column_mut(j).zip_mut_with(&col_i, |a, b| *a -= dot * b);
        }
    }

    q
}

/// Channel permutation mixing
///
/// `forward` sends input channel `perm[k]` to output channel `k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationMixing {
    perm: Vec<usize>,
    inverse_perm: Vec<usize>,
}

impl PermutationMixing {
    /// Mixing from an explicit permutation of `0..channels`
    pub fn new(perm: Vec<usize>) -> Result<Self> {
        let n = perm.len();
        let mut seen = vec![false; n];
        for &p in &perm {
            if p >= n || seen[p] {
                return Err(FlowError::Configuration(format!(
                    "{perm:?} is not a permutation of 0..{n}"
                )));
            }
            seen[p] = true;
        }
        let mut inverse_perm = vec![0; n];
        for (k, &p) in perm.iter().enumerate() {
            inverse_perm[p] = k;
        }
        Ok(Self { perm, inverse_perm })
    }

    /// Channel-order reversal over `channels` channels
    pub fn reversed(channels: usize) -> Self {
        Self::new((0..channels).rev().collect()).expect("reversal is a permutation")
    }

    fn select(&self, idx: &[usize], x: &Tensor) -> Result<Tensor> {
        if channels(x) != self.perm.len() {
            return Err(FlowError::Dimension(format!(
                "permutation covers {} channels, tensor has {}",
                self.perm.len(),
                channels(x)
            )));
        }
        Ok(x.select(Axis(CHANNEL_AXIS), idx))
    }
}

impl MixingTransform for PermutationMixing {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.select(&self.perm, x)
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.select(&self.inverse_perm, y)
    }

    fn forward_adjoint(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.forward(dx)?, self.forward(x)?))
    }

    fn inverse_adjoint(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.inverse(dy)?, self.inverse(y)?))
    }

    fn jacobian(&self, dx: &Tensor, dtheta: &[f64], x: &Tensor) -> Result<(Tensor, Tensor)> {
        if !dtheta.is_empty() {
            return Err(FlowError::Dimension(
                "permutation mixing has no parameters to perturb".into(),
            ));
        }
        Ok((self.forward(dx)?, self.forward(x)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_tensor(shape: &[usize], rng: &mut StdRng) -> Tensor {
        ArrayD::random_using(IxDyn(shape), StandardNormal, rng)
    }

    #[test]
    fn test_random_orthogonal_is_orthogonal() {
        let mut rng = StdRng::seed_from_u64(7);
        let q = random_orthogonal(8, &mut rng);
        let gram = q.t().dot(&q);
        for i in 0..8 {
            for j in 0..8 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(gram[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_orthogonal_roundtrip() {
        let mut rng = StdRng::seed_from_u64(11);
        let mixing = OrthogonalMixing::with_rng(6, &mut rng);
        let x = random_tensor(&[3, 6, 4], &mut rng);
        let y = mixing.forward(&x).unwrap();
        let back = mixing.inverse(&y).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_orthogonal_adjoint_duality() {
        // <dy, W dx> == <W^T dy, dx>
        let mut rng = StdRng::seed_from_u64(13);
        let mixing = OrthogonalMixing::with_rng(4, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let dx = random_tensor(&[2, 4, 3], &mut rng);
        let dy = random_tensor(&[2, 4, 3], &mut rng);

        let (jvp, y) = mixing.jacobian(&dx, &[], &x).unwrap();
        let (vjp, x_back) = mixing.inverse_adjoint(&dy, &y).unwrap();

        let lhs: f64 = dy.iter().zip(jvp.iter()).map(|(a, b)| a * b).sum();
        let rhs: f64 = vjp.iter().zip(dx.iter()).map(|(a, b)| a * b).sum();
        assert_relative_eq!(lhs, rhs, epsilon = 1e-10);
        for (a, b) in x.iter().zip(x_back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_set_weight_rejects_non_orthogonal() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut mixing = OrthogonalMixing::with_rng(3, &mut rng);
        let skewed = Array2::from_shape_fn((3, 3), |(i, j)| (i + 2 * j) as f64);
        assert!(mixing.set_weight(skewed).is_err());
    }

    #[test]
    fn test_permutation_roundtrip() {
        let mixing = PermutationMixing::new(vec![2, 0, 3, 1]).unwrap();
        let mut rng = StdRng::seed_from_u64(19);
        let x = random_tensor(&[2, 4, 2, 2], &mut rng);
        let y = mixing.forward(&x).unwrap();
        let back = mixing.inverse(&y).unwrap();
        assert_eq!(x, back);
    }

    #[test]
    fn test_permutation_validation() {
        assert!(PermutationMixing::new(vec![0, 0, 1]).is_err());
        assert!(PermutationMixing::new(vec![0, 3]).is_err());
    }

    #[test]
    fn test_reversed_permutation() {
        let mixing = PermutationMixing::reversed(3);
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![1.0, 2.0, 3.0]).unwrap();
        let y = mixing.forward(&x).unwrap();
        assert_eq!(y.as_slice().unwrap(), &[3.0, 2.0, 1.0]);
    }
}

//! # Pointwise predictor
//!
//! Reference implementation of the [`Predictor`] contract: a two-layer
//! network with tanh hidden units applied independently at every
//! batch/spatial position (1x1 convolution semantics). Parameters live in
//! one flat vector in `[w1, b1, w2, b2]` order so an external optimizer
//! can treat the predictor as a plain parameter block.
//!
//! All derivative paths are exact: `backward` is the full VJP including
//! the parameter-gradient block, `jacobian` the full JVP including
//! parameter directions. Hidden activations are recomputed from the
//! input on every call; nothing is cached between calls.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::Predictor;
use crate::error::{FlowError, Result};
use crate::tensor::{
    channels, ensure_same_shape, from_channel_matrix, shape_with_channels, to_channel_matrix,
    Tensor,
};

/// Hidden-layer init scale, matching the usual small-Gaussian start
const HIDDEN_INIT_SCALE: f64 = 0.1;
/// Output-layer init scale; small so a fresh layer starts near identity
const OUTPUT_INIT_SCALE: f64 = 0.01;

/// Two-layer tanh network applied per position over the channel axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointwisePredictor {
    in_channels: usize,
    hidden_dim: usize,
    fan_out: usize,
    /// (hidden, in)
    w1: Array2<f64>,
    b1: Array1<f64>,
    /// (fan_out * in, hidden)
    w2: Array2<f64>,
    b2: Array1<f64>,
}

impl PointwisePredictor {
    /// New predictor with thread-local random initialization
    ///
    /// `fan_out` is 2 for affine (scale + shift) use, 1 for additive.
    pub fn new(in_channels: usize, hidden_dim: usize, fan_out: usize) -> Result<Self> {
        Self::with_rng(in_channels, hidden_dim, fan_out, &mut rand::thread_rng())
    }

    /// New predictor drawn from the given generator
    pub fn with_rng<R: Rng>(
        in_channels: usize,
        hidden_dim: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if fan_out != 1 && fan_out != 2 {
            return Err(FlowError::Configuration(format!(
                "predictor fan-out must be 1 (additive) or 2 (affine), got {fan_out}"
            )));
        }
        if in_channels == 0 || hidden_dim == 0 {
            return Err(FlowError::Configuration(
                "predictor needs at least one input channel and one hidden unit".into(),
            ));
        }
        let out = fan_out * in_channels;
        let w1: Array2<f64> = Array2::random_using((hidden_dim, in_channels), StandardNormal, rng)
            .mapv(|v: f64| v * HIDDEN_INIT_SCALE);
        let w2: Array2<f64> = Array2::random_using((out, hidden_dim), StandardNormal, rng)
            .mapv(|v: f64| v * OUTPUT_INIT_SCALE);
        debug!(in_channels, hidden_dim, fan_out, "initialized pointwise predictor");
        Ok(Self {
            in_channels,
            hidden_dim,
            fan_out,
            w1,
            b1: Array1::zeros(hidden_dim),
            w2,
            b2: Array1::zeros(out),
        })
    }

    /// Output channel count: `fan_out * in_channels`
    pub fn out_channels(&self) -> usize {
        self.fan_out * self.in_channels
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        if channels(x) != self.in_channels {
            return Err(FlowError::Dimension(format!(
                "predictor expects {} input channels, tensor has {}",
                self.in_channels,
                channels(x)
            )));
        }
        Ok(())
    }

    fn pre_hidden(&self, x2d: &Array2<f64>) -> Array2<f64> {
        self.w1.dot(x2d) + &column(&self.b1)
    }

    /// Split a flat parameter (or tangent) vector into the four blocks
    fn unpack(&self, flat: &[f64]) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>, Array1<f64>)> {
        if flat.len() != self.num_params() {
            return Err(FlowError::Dimension(format!(
                "parameter vector has {} entries, predictor has {}",
                flat.len(),
                self.num_params()
            )));
        }
        let (h, c, o) = (self.hidden_dim, self.in_channels, self.out_channels());
        let mut at = 0;
        let w1 = Array2::from_shape_vec((h, c), flat[at..at + h * c].to_vec())
            .expect("length checked above");
        at += h * c;
        let b1 = Array1::from_vec(flat[at..at + h].to_vec());
        at += h;
        let w2 = Array2::from_shape_vec((o, h), flat[at..at + o * h].to_vec())
            .expect("length checked above");
        at += o * h;
        let b2 = Array1::from_vec(flat[at..].to_vec());
        Ok((w1, b1, w2, b2))
    }

    fn flatten(
        w1: &Array2<f64>,
        b1: &Array1<f64>,
        w2: &Array2<f64>,
        b2: &Array1<f64>,
    ) -> Vec<f64> {
        let mut flat = Vec::with_capacity(w1.len() + b1.len() + w2.len() + b2.len());
        flat.extend(w1.iter());
        flat.extend(b1.iter());
        flat.extend(w2.iter());
        flat.extend(b2.iter());
        flat
    }
}

/// Bias vector as a broadcastable column
fn column(b: &Array1<f64>) -> Array2<f64> {
    b.clone().insert_axis(Axis(1))
}

impl Predictor for PointwisePredictor {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_input(x)?;
        let x2d = to_channel_matrix(x);
        let h = self.pre_hidden(&x2d).mapv(f64::tanh);
        let raw2d = self.w2.dot(&h) + &column(&self.b2);
        let shape = shape_with_channels(x.shape(), self.out_channels());
        Ok(from_channel_matrix(&raw2d, &shape))
    }

    fn backward(&self, d_raw: &Tensor, x: &Tensor) -> Result<(Tensor, Vec<f64>)> {
        self.check_input(x)?;
        let want = shape_with_channels(x.shape(), self.out_channels());
        if d_raw.shape() != want.as_slice() {
            return Err(FlowError::Dimension(format!(
                "output cotangent has shape {:?}, expected {:?}",
                d_raw.shape(),
                want
            )));
        }

        let x2d = to_channel_matrix(x);
        let h = self.pre_hidden(&x2d).mapv(f64::tanh);
        let draw2d = to_channel_matrix(d_raw);

        // tanh' = 1 - h^2, expressed through the activation itself
        let dh = self.w2.t().dot(&draw2d) * &h.mapv(|v| 1.0 - v * v);
        let dx2d = self.w1.t().dot(&dh);

        let dw2 = draw2d.dot(&h.t());
        let db2 = draw2d.sum_axis(Axis(1));
        let dw1 = dh.dot(&x2d.t());
        let db1 = dh.sum_axis(Axis(1));

        Ok((
            from_channel_matrix(&dx2d, x.shape()),
            Self::flatten(&dw1, &db1, &dw2, &db2),
        ))
    }

    fn jacobian(&self, dx: &Tensor, dtheta: &[f64], x: &Tensor) -> Result<(Tensor, Tensor)> {
        self.check_input(x)?;
        ensure_same_shape("predictor input tangent", dx, x)?;

        let x2d = to_channel_matrix(x);
        let dx2d = to_channel_matrix(dx);
        let h = self.pre_hidden(&x2d).mapv(f64::tanh);
        let deriv = h.mapv(|v| 1.0 - v * v);

        let raw2d = self.w2.dot(&h) + &column(&self.b2);
        let draw2d = if dtheta.is_empty() {
            let dh = self.w1.dot(&dx2d) * &deriv;
            self.w2.dot(&dh)
        } else {
            let (dw1, db1, dw2, db2) = self.unpack(dtheta)?;
            let dpre = self.w1.dot(&dx2d) + dw1.dot(&x2d) + column(&db1);
            let dh = dpre * &deriv;
            self.w2.dot(&dh) + dw2.dot(&h) + column(&db2)
        };

        let shape = shape_with_channels(x.shape(), self.out_channels());
        Ok((
            from_channel_matrix(&draw2d, &shape),
            from_channel_matrix(&raw2d, &shape),
        ))
    }

    fn fan_out(&self) -> usize {
        self.fan_out
    }

    fn num_params(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }

    fn params(&self) -> Vec<f64> {
        Self::flatten(&self.w1, &self.b1, &self.w2, &self.b2)
    }

    fn set_params(&mut self, params: &[f64]) -> Result<()> {
        let (w1, b1, w2, b2) = self.unpack(params)?;
        self.w1 = w1;
        self.b1 = b1;
        self.w2 = w2;
        self.b2 = b2;
        Ok(())
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

    fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_fan_out_controls_output_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let affine = PointwisePredictor::with_rng(4, 8, 2, &mut rng).unwrap();
        let additive = PointwisePredictor::with_rng(4, 8, 1, &mut rng).unwrap();
        let x = random_tensor(&[2, 4, 3], &mut rng);
        assert_eq!(channels(&affine.forward(&x).unwrap()), 8);
        assert_eq!(channels(&additive.forward(&x).unwrap()), 4);
    }

    #[test]
    fn test_invalid_fan_out_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        assert!(PointwisePredictor::with_rng(4, 8, 3, &mut rng).is_err());
        assert!(PointwisePredictor::with_rng(0, 8, 1, &mut rng).is_err());
    }

    #[test]
    fn test_params_roundtrip() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut p = PointwisePredictor::with_rng(3, 5, 2, &mut rng).unwrap();
        let flat = p.params();
        assert_eq!(flat.len(), p.num_params());
        p.set_params(&flat).unwrap();
        assert_eq!(p.params(), flat);
        assert!(p.set_params(&flat[1..]).is_err());
    }

    #[test]
    fn test_backward_matches_numeric_input_gradient() {
        let mut rng = StdRng::seed_from_u64(4);
        let p = PointwisePredictor::with_rng(3, 8, 2, &mut rng).unwrap();
        let x = random_tensor(&[2, 3, 4], &mut rng);
        let d_raw = random_tensor(&[2, 6, 4], &mut rng);
        let probe = random_tensor(&[2, 3, 4], &mut rng);

        let (dx, _) = p.backward(&d_raw, &x).unwrap();
        let analytic = dot(&dx, &probe);

        let h = 1e-6;
        let plus = p.forward(&(&x + &probe.mapv(|v| v * h))).unwrap();
        let minus = p.forward(&(&x - &probe.mapv(|v| v * h))).unwrap();
        let numeric = dot(&d_raw, &((plus - minus) / (2.0 * h)));
        assert_relative_eq!(analytic, numeric, epsilon = 1e-6, max_relative = 1e-6);
    }

    #[test]
    fn test_jacobian_backward_duality() {
        // <d_raw, J_x dx + J_theta dtheta> == <vjp(d_raw), dx> + <param_grad, dtheta>
        let mut rng = StdRng::seed_from_u64(5);
        let p = PointwisePredictor::with_rng(4, 6, 1, &mut rng).unwrap();
        let x = random_tensor(&[1, 4, 5], &mut rng);
        let dx = random_tensor(&[1, 4, 5], &mut rng);
        let d_raw = random_tensor(&[1, 4, 5], &mut rng);
        let dtheta: Vec<f64> = (0..p.num_params()).map(|_| rng.gen::<f64>() - 0.5).collect();

        let (jvp, _) = p.jacobian(&dx, &dtheta, &x).unwrap();
        let (vjp, grads) = p.backward(&d_raw, &x).unwrap();

        let lhs = dot(&d_raw, &jvp);
        let rhs =
            dot(&vjp, &dx) + grads.iter().zip(&dtheta).map(|(g, d)| g * d).sum::<f64>();
        assert_relative_eq!(lhs, rhs, epsilon = 1e-9, max_relative = 1e-9);
    }

    #[test]
    fn test_parameter_gradient_matches_numeric() {
        let mut rng = StdRng::seed_from_u64(6);
        let p = PointwisePredictor::with_rng(2, 4, 2, &mut rng).unwrap();
        let x = random_tensor(&[2, 2, 3], &mut rng);
        let d_raw = random_tensor(&[2, 4, 3], &mut rng);

        let (_, grads) = p.backward(&d_raw, &x).unwrap();

        let h = 1e-6;
        let base = p.params();
        for idx in [0, 3, grads.len() / 2, grads.len() - 1] {
            let mut plus = p.clone();
            let mut minus = p.clone();
            let mut pp = base.clone();
            pp[idx] += h;
            plus.set_params(&pp).unwrap();
            pp[idx] -= 2.0 * h;
            minus.set_params(&pp).unwrap();
            let numeric = dot(
                &d_raw,
                &((plus.forward(&x).unwrap() - minus.forward(&x).unwrap()) / (2.0 * h)),
            );
            assert_relative_eq!(grads[idx], numeric, epsilon = 1e-6, max_relative = 1e-5);
        }
    }
}

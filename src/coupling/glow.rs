//! General (affine/additive) coupling layer.
//!
//! The forward transform mixes channels once, splits them, predicts a
//! scale and shift from the untouched half and combines:
//!
//! ```text
//! X_ = Mixing(X);  (X1, X2) = split(X_)
//! Y1 = S(X2) * X1 + T(X2);  Y2 = X2;  Y = concat(Y1, Y2)
//! ```
//!
//! Because `Y2 = X2` passes through untouched, `S` and `T` can be
//! recomputed exactly from the output, which is what makes the closed
//! form inverse and the store-nothing gradient pass possible.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::INVERSE_EPS;
use crate::contract::{ActivationGate, MixingTransform, Predictor};
use crate::error::{FlowError, Result};
use crate::gradient::{CouplingGrads, ParamTangent};
use crate::logdet;
use crate::tensor::{
    batch_size, concat_channels, ensure_same_shape, split_channels, ChannelMask, Tensor,
};

/// Which combine rule a [`CouplingLayer`] applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingVariant {
    /// `Y1 = S * X1 + T`, with `S` produced by an activation gate
    Affine,
    /// `Y1 = X1 + T`, no scale and no log-determinant
    Additive,
}

/// Combine strategy chosen at construction; the affine arm owns the gate
enum Strategy {
    Affine { gate: Box<dyn ActivationGate> },
    Additive,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Affine { gate } => f.debug_struct("Affine").field("gate", gate).finish(),
            Strategy::Additive => f.write_str("Additive"),
        }
    }
}

/// Activations reconstructed from a layer output by [`CouplingLayer::recompute`]
///
/// `x1`/`x2` are the post-mixing halves; `scale` is present for the
/// affine variant only.
#[derive(Debug, Clone)]
pub struct CouplingState {
    /// Recovered layer input
    pub x: Tensor,
    /// Transformed half, pre-combine (post-mixing domain)
    pub x1: Tensor,
    /// Untouched half (post-mixing domain)
    pub x2: Tensor,
    /// Gate output `S`, affine variant only
    pub scale: Option<Tensor>,
}

/// Output of [`CouplingLayer::jacobian`]
#[derive(Debug, Clone)]
pub struct JacobianOutput {
    /// Propagated tangent `J * (dX, dtheta)`
    pub dy: Tensor,
    /// Layer output at the linearization point
    pub y: Tensor,
    /// Log-determinant at the linearization point (0 when untracked)
    pub logdet: f64,
    /// Directional derivative of the log-determinant along the tangent
    pub dlogdet: f64,
    /// Gauss-Newton curvature of the log-determinant term, as a
    /// predictor-parameter vector (zeros when untracked or additive)
    pub gauss_newton: Vec<f64>,
}

/// Affine/additive general coupling layer
///
/// Owns its collaborators; an external optimizer reaches them through
/// [`predictor_mut`](Self::predictor_mut) and
/// [`mixing_mut`](Self::mixing_mut). All operations take `&self` and
/// keep no state between calls.
#[derive(Debug)]
pub struct CouplingLayer<M, P> {
    mixing: M,
    predictor: P,
    strategy: Strategy,
    mask: Option<ChannelMask>,
    track_logdet: bool,
}

impl<M: MixingTransform, P: Predictor> CouplingLayer<M, P> {
    /// Affine coupling: `Y1 = gate(logS) * X1 + T`
    ///
    /// Fails if the predictor is not in fan-out mode or the mask does not
    /// select exactly half of its channels.
    pub fn affine(
        mixing: M,
        predictor: P,
        gate: Box<dyn ActivationGate>,
        mask: Option<ChannelMask>,
        track_logdet: bool,
    ) -> Result<Self> {
        if predictor.fan_out() != 2 {
            return Err(FlowError::Configuration(format!(
                "affine coupling requires a fan-out predictor (fan_out = 2), got {}",
                predictor.fan_out()
            )));
        }
        Self::with_strategy(mixing, predictor, Strategy::Affine { gate }, mask, track_logdet)
    }

    /// Additive coupling: `Y1 = X1 + T`, no gate, no log-determinant
    pub fn additive(mixing: M, predictor: P, mask: Option<ChannelMask>) -> Result<Self> {
        if predictor.fan_out() != 1 {
            return Err(FlowError::Configuration(format!(
                "additive coupling requires a shift-only predictor (fan_out = 1), got {}",
                predictor.fan_out()
            )));
        }
        Self::with_strategy(mixing, predictor, Strategy::Additive, mask, false)
    }

    fn with_strategy(
        mixing: M,
        predictor: P,
        strategy: Strategy,
        mask: Option<ChannelMask>,
        track_logdet: bool,
    ) -> Result<Self> {
        if let Some(m) = &mask {
            check_mask(m)?;
        }
        let variant = match &strategy {
            Strategy::Affine { .. } => CouplingVariant::Affine,
            Strategy::Additive => CouplingVariant::Additive,
        };
        debug!(?variant, masked = mask.is_some(), track_logdet, "constructed coupling layer");
        Ok(Self {
            mixing,
            predictor,
            strategy,
            mask,
            track_logdet,
        })
    }

    /// The layer's combine rule
    pub fn variant(&self) -> CouplingVariant {
        match self.strategy {
            Strategy::Affine { .. } => CouplingVariant::Affine,
            Strategy::Additive => CouplingVariant::Additive,
        }
    }

    /// Whether forward passes report a log-determinant
    pub fn track_logdet(&self) -> bool {
        self.track_logdet
    }

    /// The channel mask, if the split is non-contiguous
    pub fn mask(&self) -> Option<&ChannelMask> {
        self.mask.as_ref()
    }

    /// Shared view of the mixing transform
    pub fn mixing(&self) -> &M {
        &self.mixing
    }

    /// Mutable access for an external optimizer
    pub fn mixing_mut(&mut self) -> &mut M {
        &mut self.mixing
    }

    /// Shared view of the predictor
    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    /// Mutable access for an external optimizer
    pub fn predictor_mut(&mut self) -> &mut P {
        &mut self.predictor
    }

    /// Recompute `(S, T)` from the untouched half; pure in `x2`
    fn scale_shift(&self, x2: &Tensor) -> Result<(Option<Tensor>, Tensor)> {
        let raw = self.predictor.forward(x2)?;
        match &self.strategy {
            Strategy::Affine { gate } => {
                let (log_s, t) = split_channels(&raw, None)?;
                Ok((Some(gate.forward(&log_s)), t))
            }
            Strategy::Additive => Ok((None, raw)),
        }
    }

    /// Transform `X -> Y`, returning the batch-normalized log-determinant
    /// (0 unless the layer is affine and `track_logdet` is set)
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, f64)> {
        let x_mixed = self.mixing.forward(x)?;
        let (x1, x2) = split_channels(&x_mixed, self.mask.as_ref())?;
        let (s, t) = self.scale_shift(&x2)?;

        let (y1, ld) = match &s {
            Some(s) => {
                let y1 = &x1 * s + &t;
                let ld = if self.track_logdet {
                    logdet::scale_logdet(s, batch_size(x))
                } else {
                    0.0
                };
                (y1, ld)
            }
            None => (&x1 + &t, 0.0),
        };

        let y = concat_channels(&y1, &x2, self.mask.as_ref())?;
        Ok((y, ld))
    }

    /// Exact inverse of [`forward`](Self::forward), up to the epsilon
    /// guard on the scale division
    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        Ok(self.recompute(y)?.x)
    }

    /// Reconstruct the input and every intermediate the gradient pass
    /// needs from an output tensor
    ///
    /// `S` and `T` are pure functions of the untouched half, so this is
    /// exact recomputation, not approximation.
    pub fn recompute(&self, y: &Tensor) -> Result<CouplingState> {
        trace!("recomputing coupling activations from output");
        let (y1, x2) = split_channels(y, self.mask.as_ref())?;
        let (s, t) = self.scale_shift(&x2)?;

        let x1 = match &s {
            // epsilon keeps the division finite when S saturates toward 0
            Some(s) => (&y1 - &t) / &(s + INVERSE_EPS),
            None => &y1 - &t,
        };

        let x_mixed = concat_channels(&x1, &x2, self.mask.as_ref())?;
        let x = self.mixing.inverse(&x_mixed)?;
        Ok(CouplingState {
            x,
            x1,
            x2,
            scale: s,
        })
    }

    /// Adjoint pass over reconstructed activations: pull the output
    /// cotangent `dy` back to the input, returning the predictor's
    /// parameter-gradient contribution by value
    pub fn gradient(&self, state: &CouplingState, dy: &Tensor) -> Result<(Tensor, CouplingGrads)> {
        ensure_same_shape("output cotangent vs output", dy, &state.x)?;
        let (dy1, dy2) = split_channels(dy, self.mask.as_ref())?;

        let (d_raw, dx1) = match &self.strategy {
            Strategy::Affine { gate } => {
                let s = state.scale.as_ref().ok_or_else(|| {
                    FlowError::Dimension("recomputed state is missing scale factors".into())
                })?;
                let dt = dy1.clone();
                let mut ds = &dy1 * &state.x1;
                if self.track_logdet {
                    // the log-determinant term feeds the scale gradient directly
                    ds = ds - logdet::scale_logdet_grad(s, batch_size(&state.x));
                }
                let d_log_s = gate.backward(&ds, s);
                let d_raw = concat_channels(&d_log_s, &dt, None)?;
                (d_raw, &dy1 * s)
            }
            Strategy::Additive => (dy1.clone(), dy1.clone()),
        };

        let (dx2_pred, d_theta) = self.predictor.backward(&d_raw, &state.x2)?;
        let dx2 = dx2_pred + &dy2;

        let d_mixed = concat_channels(&dx1, &dx2, self.mask.as_ref())?;
        let x_mixed = concat_channels(&state.x1, &state.x2, self.mask.as_ref())?;
        let (dx, _) = self.mixing.inverse_adjoint(&d_mixed, &x_mixed)?;

        Ok((dx, CouplingGrads { predictor: d_theta }))
    }

    /// Gradient pass that stores nothing: reconstructs activations from
    /// `y` via [`recompute`](Self::recompute), then runs
    /// [`gradient`](Self::gradient). Returns `(dX, X, grads)`.
    pub fn backward(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor, CouplingGrads)> {
        let state = self.recompute(y)?;
        let (dx, grads) = self.gradient(&state, dy)?;
        Ok((dx, state.x, grads))
    }

    /// Reverse-direction gradient: pull a cotangent at the input side
    /// through the *inverse* map, returning `(dY, Y, grads)`
    ///
    /// Needed by iterative-refinement schemes that traverse the layer
    /// backward during optimization. `Y` is recomputed from `X` by a
    /// forward-style prediction on the untouched half.
    pub fn backward_inv(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor, CouplingGrads)> {
        ensure_same_shape("input cotangent vs input", dx, x)?;
        let (d_mixed, x_mixed) = self.mixing.forward_adjoint(dx, x)?;
        let (dx1, dx2) = split_channels(&d_mixed, self.mask.as_ref())?;
        let (x1, x2) = split_channels(&x_mixed, self.mask.as_ref())?;
        let (s, t) = self.scale_shift(&x2)?;

        let (y1, d_raw, dy1) = match (&self.strategy, &s) {
            (Strategy::Affine { gate }, Some(s)) => {
                let y1 = &x1 * s + &t;
                let dt = -(&dx1 / &(s + INVERSE_EPS));
                let mut ds = &x1 * &dt;
                if self.track_logdet {
                    // reverse traversal: the logdet term enters with the
                    // opposite sign to the forward-direction pass
                    ds = ds + logdet::scale_logdet_grad(s, batch_size(x));
                }
                let d_log_s = gate.backward(&ds, s);
                let d_raw = concat_channels(&d_log_s, &dt, None)?;
                let dy1 = -&dt;
                (y1, d_raw, dy1)
            }
            _ => {
                // additive: dX1/dY1 = 1 and dT picks up the sign flip
                let y1 = &x1 + &t;
                (y1, -&dx1, dx1.clone())
            }
        };

        let (dy2_pred, d_theta) = self.predictor.backward(&d_raw, &x2)?;
        let dy2 = dy2_pred + &dx2;

        let y = concat_channels(&y1, &x2, self.mask.as_ref())?;
        let dy = concat_channels(&dy1, &dy2, self.mask.as_ref())?;
        Ok((dy, y, CouplingGrads { predictor: d_theta }))
    }

    /// Forward-mode linearization: propagate an input tangent and a
    /// parameter direction along the same control path as
    /// [`forward`](Self::forward)
    ///
    /// When the log-determinant is tracked, also computes its directional
    /// derivative and a Gauss-Newton approximation of its curvature with
    /// respect to the predictor parameters (a parameter-only scale
    /// tangent pushed back through `J^T diag(1/S^2)/batch`), avoiding the
    /// full Hessian of `sum(log|S|)`.
    pub fn jacobian(&self, dx: &Tensor, dtheta: &ParamTangent, x: &Tensor) -> Result<JacobianOutput> {
        ensure_same_shape("input tangent vs input", dx, x)?;
        let (dx_mixed, x_mixed) = self.mixing.jacobian(dx, &dtheta.mixing, x)?;
        let (x1, x2) = split_channels(&x_mixed, self.mask.as_ref())?;
        let (dx1, dx2) = split_channels(&dx_mixed, self.mask.as_ref())?;

        let (d_raw, raw) = self.predictor.jacobian(&dx2, &dtheta.predictor, &x2)?;

        let (y1, dy1, ld, dld, gn) = match &self.strategy {
            Strategy::Affine { gate } => {
                let (log_s, t) = split_channels(&raw, None)?;
                let (d_log_s, dt) = split_channels(&d_raw, None)?;
                let s = gate.forward(&log_s);
                // elementwise gate: backward doubles as the JVP
                let ds = gate.backward(&d_log_s, &s);

                let y1 = &x1 * &s + &t;
                let dy1 = &dx1 * &s + &ds * &x1 + &dt;

                if self.track_logdet {
                    let batch = batch_size(x);
                    let ld = logdet::scale_logdet(&s, batch);
                    let dld = (&ds * &logdet::scale_logdet_grad(&s, batch)).sum();
                    let gn = self.logdet_gauss_newton(gate.as_ref(), &s, &t, &x2, dtheta)?;
                    (y1, dy1, ld, dld, gn)
                } else {
                    (y1, dy1, 0.0, 0.0, vec![0.0; self.predictor.num_params()])
                }
            }
            Strategy::Additive => {
                let y1 = &x1 + &raw;
                let dy1 = &dx1 + &d_raw;
                (y1, dy1, 0.0, 0.0, vec![0.0; self.predictor.num_params()])
            }
        };

        let y = concat_channels(&y1, &x2, self.mask.as_ref())?;
        let dy = concat_channels(&dy1, &dx2, self.mask.as_ref())?;
        Ok(JacobianOutput {
            dy,
            y,
            logdet: ld,
            dlogdet: dld,
            gauss_newton: gn,
        })
    }

    /// Gauss-Newton product `J_theta^T diag(1/(S^2 batch)) J_theta dtheta`
    /// for the log-determinant term
    fn logdet_gauss_newton(
        &self,
        gate: &dyn ActivationGate,
        s: &Tensor,
        t: &Tensor,
        x2: &Tensor,
        dtheta: &ParamTangent,
    ) -> Result<Vec<f64>> {
        if dtheta.predictor.is_empty() {
            return Ok(vec![0.0; self.predictor.num_params()]);
        }
        let batch = batch_size(x2);
        // parameter-only directional probe: zero input tangent
        let zeros = Tensor::zeros(x2.raw_dim());
        let (d_raw_p, _) = self.predictor.jacobian(&zeros, &dtheta.predictor, x2)?;
        let (d_log_s_p, _) = split_channels(&d_raw_p, None)?;
        let ds_p = gate.backward(&d_log_s_p, s);

        let denom = &(s * s) * batch as f64;
        let probe = gate.backward(&(&ds_p / &denom), s);
        let d_raw_probe = concat_channels(&probe, &Tensor::zeros(t.raw_dim()), None)?;
        let (_, gn) = self.predictor.backward(&d_raw_probe, x2)?;
        Ok(gn)
    }

    /// The VJP dual of [`jacobian`](Self::jacobian): identical to
    /// [`backward`](Self::backward) with the recovered input dropped
    pub fn adjoint_jacobian(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, CouplingGrads)> {
        let state = self.recompute(y)?;
        self.gradient(&state, dy)
    }
}

/// Construction-time mask validation shared by both engines
pub(crate) fn check_mask(mask: &ChannelMask) -> Result<()> {
    let sel = mask.selected_count();
    if sel == 0 || sel == mask.len() {
        return Err(FlowError::Configuration(
            "channel mask must select a strict subset of channels".into(),
        ));
    }
    if !mask.is_balanced() {
        return Err(FlowError::Configuration(format!(
            "channel mask must select exactly half of the channels, selects {sel} of {}",
            mask.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::SigmoidGate;
    use crate::mixing::OrthogonalMixing;
    use crate::predictor::PointwisePredictor;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_tensor(shape: &[usize], rng: &mut StdRng) -> Tensor {
        ArrayD::random_using(IxDyn(shape), StandardNormal, rng)
    }

    fn affine_layer(
        channels: usize,
        track_logdet: bool,
        rng: &mut StdRng,
    ) -> CouplingLayer<OrthogonalMixing, PointwisePredictor> {
        let mixing = OrthogonalMixing::with_rng(channels, rng);
        let predictor = PointwisePredictor::with_rng(channels / 2, 16, 2, rng).unwrap();
        CouplingLayer::affine(mixing, predictor, Box::new(SigmoidGate), None, track_logdet)
            .unwrap()
    }

    fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_affine_construction_requires_fan_out() {
        let mut rng = StdRng::seed_from_u64(1);
        let mixing = OrthogonalMixing::with_rng(8, &mut rng);
        let shift_only = PointwisePredictor::with_rng(4, 8, 1, &mut rng).unwrap();
        let err = CouplingLayer::affine(mixing, shift_only, Box::new(SigmoidGate), None, false);
        assert!(matches!(err, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_additive_construction_rejects_fan_out() {
        let mut rng = StdRng::seed_from_u64(2);
        let mixing = OrthogonalMixing::with_rng(8, &mut rng);
        let fan_out = PointwisePredictor::with_rng(4, 8, 2, &mut rng).unwrap();
        assert!(CouplingLayer::additive(mixing, fan_out, None).is_err());
    }

    #[test]
    fn test_unbalanced_mask_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mixing = OrthogonalMixing::with_rng(8, &mut rng);
        let predictor = PointwisePredictor::with_rng(4, 8, 2, &mut rng).unwrap();
        let mask = ChannelMask::new(vec![true, false, false, false, false, false, false, false])
            .unwrap();
        let err =
            CouplingLayer::affine(mixing, predictor, Box::new(SigmoidGate), Some(mask), false);
        assert!(matches!(err, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_affine_roundtrip() {
        let mut rng = StdRng::seed_from_u64(4);
        let layer = affine_layer(8, true, &mut rng);
        let x = random_tensor(&[4, 8, 5], &mut rng);
        let (y, _) = layer.forward(&x).unwrap();
        let back = layer.inverse(&y).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_additive_roundtrip() {
        let mut rng = StdRng::seed_from_u64(5);
        let mixing = OrthogonalMixing::with_rng(6, &mut rng);
        let predictor = PointwisePredictor::with_rng(3, 12, 1, &mut rng).unwrap();
        let layer = CouplingLayer::additive(mixing, predictor, None).unwrap();
        let x = random_tensor(&[2, 6, 3, 3], &mut rng);
        let (y, ld) = layer.forward(&x).unwrap();
        assert_eq!(ld, 0.0);
        let back = layer.inverse(&y).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_forward_is_pure() {
        let mut rng = StdRng::seed_from_u64(6);
        let layer = affine_layer(4, true, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let (y1, ld1) = layer.forward(&x).unwrap();
        let (y2, ld2) = layer.forward(&x).unwrap();
        assert_eq!(y1, y2);
        assert_eq!(ld1.to_bits(), ld2.to_bits());
    }

    #[test]
    fn test_backward_matches_numeric_vjp() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = affine_layer(4, false, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let dy = random_tensor(&[2, 4, 3], &mut rng);
        let probe = random_tensor(&[2, 4, 3], &mut rng);

        let (y, _) = layer.forward(&x).unwrap();
        let (dx, x_back, _) = layer.backward(&dy, &y).unwrap();
        for (a, b) in x.iter().zip(x_back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9, max_relative = 1e-9);
        }

        let h = 1e-6;
        let (plus, _) = layer.forward(&(&x + &probe.mapv(|v| v * h))).unwrap();
        let (minus, _) = layer.forward(&(&x - &probe.mapv(|v| v * h))).unwrap();
        let numeric = dot(&dy, &((plus - minus) / (2.0 * h)));
        assert_relative_eq!(dot(&dx, &probe), numeric, epsilon = 1e-5, max_relative = 1e-5);
    }

    #[test]
    fn test_backward_inv_matches_numeric_vjp_of_inverse() {
        let mut rng = StdRng::seed_from_u64(8);
        let layer = affine_layer(6, false, &mut rng);
        let x0 = random_tensor(&[1, 6, 4], &mut rng);
        let (y, _) = layer.forward(&x0).unwrap();

        let dx = random_tensor(&[1, 6, 4], &mut rng);
        let probe = random_tensor(&[1, 6, 4], &mut rng);

        let (dy, y_back, _) = layer.backward_inv(&dx, &x0).unwrap();
        for (a, b) in y.iter().zip(y_back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9, max_relative = 1e-9);
        }

        let h = 1e-6;
        let plus = layer.inverse(&(&y + &probe.mapv(|v| v * h))).unwrap();
        let minus = layer.inverse(&(&y - &probe.mapv(|v| v * h))).unwrap();
        let numeric = dot(&dx, &((plus - minus) / (2.0 * h)));
        assert_relative_eq!(dot(&dy, &probe), numeric, epsilon = 1e-5, max_relative = 1e-5);
    }

    #[test]
    fn test_jacobian_adjoint_duality() {
        let mut rng = StdRng::seed_from_u64(9);
        let layer = affine_layer(8, false, &mut rng);
        let x = random_tensor(&[2, 8, 4], &mut rng);
        let dx = random_tensor(&[2, 8, 4], &mut rng);
        let dy_cot = random_tensor(&[2, 8, 4], &mut rng);

        let out = layer.jacobian(&dx, &ParamTangent::zero(), &x).unwrap();
        let (dx_adj, _) = layer.adjoint_jacobian(&dy_cot, &out.y).unwrap();

        let lhs = dot(&dy_cot, &out.dy);
        let rhs = dot(&dx_adj, &dx);
        assert_relative_eq!(lhs, rhs, epsilon = 1e-8, max_relative = 1e-8);
    }

    #[test]
    fn test_jacobian_parameter_duality() {
        // <dY_cot, J_theta dtheta> == <param_grads(dY_cot), dtheta>
        let mut rng = StdRng::seed_from_u64(10);
        let layer = affine_layer(4, false, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let dy_cot = random_tensor(&[2, 4, 3], &mut rng);
        let n = layer.predictor().num_params();
        let dtheta: Vec<f64> = (0..n).map(|i| ((i % 7) as f64 - 3.0) * 0.1).collect();

        let zero_dx = Tensor::zeros(x.raw_dim());
        let out = layer
            .jacobian(&zero_dx, &ParamTangent::predictor(dtheta.clone()), &x)
            .unwrap();
        let (_, grads) = layer.adjoint_jacobian(&dy_cot, &out.y).unwrap();

        let lhs = dot(&dy_cot, &out.dy);
        let rhs = grads.dot(&dtheta);
        assert_relative_eq!(lhs, rhs, epsilon = 1e-8, max_relative = 1e-8);
    }

    #[test]
    fn test_logdet_gradient_flows_into_backward() {
        // with track_logdet the backward pass carries an extra term; the
        // difference against the untracked gradient must match the
        // analytic logdet gradient pushed through predictor and mixing
        let mut rng = StdRng::seed_from_u64(11);
        let tracked = affine_layer(4, true, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let (y, ld) = tracked.forward(&x).unwrap();
        assert!(ld.is_finite());

        let dy = Tensor::zeros(y.raw_dim());
        let (dx, _, _) = tracked.backward(&dy, &y).unwrap();
        // zero cotangent still yields a nonzero input gradient purely
        // from the logdet term
        assert!(dx.iter().any(|&v| v.abs() > 0.0));

        let h = 1e-6;
        let probe = random_tensor(&[2, 4, 3], &mut rng);
        let (_, ld_plus) = tracked.forward(&(&x + &probe.mapv(|v| v * h))).unwrap();
        let (_, ld_minus) = tracked.forward(&(&x - &probe.mapv(|v| v * h))).unwrap();
        let numeric = (ld_plus - ld_minus) / (2.0 * h);
        // backward's convention subtracts the logdet contribution
        assert_relative_eq!(dot(&dx, &probe), -numeric, epsilon = 1e-5, max_relative = 1e-4);
    }

    #[test]
    fn test_logdet_gradient_flows_into_backward_inv() {
        // with a zero input cotangent the reverse pass yields exactly the
        // gradient of the recomputed logdet with respect to the output
        let mut rng = StdRng::seed_from_u64(13);
        let tracked = affine_layer(4, true, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let (y, _) = tracked.forward(&x).unwrap();

        let dx = Tensor::zeros(x.raw_dim());
        let (dy, y_back, _) = tracked.backward_inv(&dx, &x).unwrap();
        for (a, b) in y.iter().zip(y_back.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9, max_relative = 1e-9);
        }
        assert!(dy.iter().any(|&v| v.abs() > 0.0));

        let ld_at = |yp: &Tensor| {
            let s = tracked.recompute(yp).unwrap().scale.unwrap();
            logdet::scale_logdet(&s, 2)
        };
        let h = 1e-6;
        let probe = random_tensor(&[2, 4, 3], &mut rng);
        let numeric = (ld_at(&(&y + &probe.mapv(|v| v * h)))
            - ld_at(&(&y - &probe.mapv(|v| v * h))))
            / (2.0 * h);
        assert_relative_eq!(dot(&dy, &probe), numeric, epsilon = 1e-5, max_relative = 1e-4);
    }

    #[test]
    fn test_jacobian_dlogdet_matches_numeric() {
        let mut rng = StdRng::seed_from_u64(12);
        let layer = affine_layer(4, true, &mut rng);
        let x = random_tensor(&[2, 4, 3], &mut rng);
        let dx = random_tensor(&[2, 4, 3], &mut rng);

        let out = layer.jacobian(&dx, &ParamTangent::zero(), &x).unwrap();

        let h = 1e-6;
        let (_, ld_plus) = layer.forward(&(&x + &dx.mapv(|v| v * h))).unwrap();
        let (_, ld_minus) = layer.forward(&(&x - &dx.mapv(|v| v * h))).unwrap();
        let numeric = (ld_plus - ld_minus) / (2.0 * h);
        assert_relative_eq!(out.dlogdet, numeric, epsilon = 1e-5, max_relative = 1e-4);
    }
}

//! Additive round-trip coupling layer.
//!
//! Unlike the general layer, this variant leaves the mixed domain before
//! returning: the mixing transform runs forward at entry and its inverse
//! runs again at exit,
//!
//! ```text
//! X_ = Mixing(X);  (X1, X2) = split(X_)
//! Y1 = X1;  Y2 = X2 + T(Y1)
//! Y  = Mixing^-1(concat(Y1, Y2))
//! ```
//!
//! so `inverse` starts by re-applying `Mixing::forward` to the output.
//! Every gradient path therefore traverses the mixing transform twice,
//! which is why the contract's paired adjoint operations exist. No scale,
//! no gate, no log-determinant: the layer is volume-preserving whenever
//! the mixing is.

use tracing::{debug, trace};

use crate::contract::{MixingTransform, Predictor};
use crate::error::{FlowError, Result};
use crate::gradient::{CouplingGrads, ParamTangent};
use crate::tensor::{concat_channels, ensure_same_shape, split_channels, ChannelMask, Tensor};

use super::glow::check_mask;

/// Activations reconstructed from a layer output by
/// [`RimCouplingLayer::recompute`]
///
/// The halves live in the mixed domain; `y` is the output the state was
/// reconstructed from (the adjoint of the exit mixing is anchored at it).
#[derive(Debug, Clone)]
pub struct RimState {
    /// Recovered layer input
    pub x: Tensor,
    /// Identity branch, mixed domain
    pub x1: Tensor,
    /// Shifted branch before the shift, mixed domain
    pub x2: Tensor,
    /// The output this state was recomputed from
    pub y: Tensor,
}

/// Additive round-trip coupling layer
#[derive(Debug)]
pub struct RimCouplingLayer<M, P> {
    mixing: M,
    predictor: P,
    mask: Option<ChannelMask>,
}

impl<M: MixingTransform, P: Predictor> RimCouplingLayer<M, P> {
    /// New round-trip layer; the predictor must be shift-only
    pub fn new(mixing: M, predictor: P, mask: Option<ChannelMask>) -> Result<Self> {
        if predictor.fan_out() != 1 {
            return Err(FlowError::Configuration(format!(
                "round-trip coupling requires a shift-only predictor (fan_out = 1), got {}",
                predictor.fan_out()
            )));
        }
        if let Some(m) = &mask {
            check_mask(m)?;
        }
        debug!(masked = mask.is_some(), "constructed round-trip coupling layer");
        Ok(Self {
            mixing,
            predictor,
            mask,
        })
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

    /// Transform `X -> Y`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_mixed = self.mixing.forward(x)?;
        let (x1, x2) = split_channels(&x_mixed, self.mask.as_ref())?;
        let t = self.predictor.forward(&x1)?;
        let y2 = &x2 + &t;
        let z = concat_channels(&x1, &y2, self.mask.as_ref())?;
        self.mixing.inverse(&z)
    }

    /// Exact inverse of [`forward`](Self::forward); no epsilon is needed
    /// since the combine step is purely additive
    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        Ok(self.recompute(y)?.x)
    }

    /// Reconstruct the input and the mixed-domain halves from an output
    pub fn recompute(&self, y: &Tensor) -> Result<RimState> {
        trace!("recomputing round-trip coupling activations from output");
        let z = self.mixing.forward(y)?;
        let (x1, y2) = split_channels(&z, self.mask.as_ref())?;
        let t = self.predictor.forward(&x1)?;
        let x2 = &y2 - &t;
        let x_mixed = concat_channels(&x1, &x2, self.mask.as_ref())?;
        let x = self.mixing.inverse(&x_mixed)?;
        Ok(RimState {
            x,
            x1,
            x2,
            y: y.clone(),
        })
    }

    /// Adjoint pass over reconstructed activations: pull the output
    /// cotangent back through exit mixing, combine step and entry mixing
    pub fn gradient(&self, state: &RimState, dy: &Tensor) -> Result<(Tensor, CouplingGrads)> {
        ensure_same_shape("output cotangent vs output", dy, &state.y)?;
        // exit traversal: cotangent of Mixing^-1, anchored at the output
        let (dz, _) = self.mixing.forward_adjoint(dy, &state.y)?;
        let (dz1, dz2) = split_channels(&dz, self.mask.as_ref())?;

        let (dt_back, d_theta) = self.predictor.backward(&dz2, &state.x1)?;
        let dx1 = &dz1 + &dt_back;
        let dx2 = dz2;

        // entry traversal
        let d_mixed = concat_channels(&dx1, &dx2, self.mask.as_ref())?;
        let x_mixed = concat_channels(&state.x1, &state.x2, self.mask.as_ref())?;
        let (dx, _) = self.mixing.inverse_adjoint(&d_mixed, &x_mixed)?;

        Ok((dx, CouplingGrads { predictor: d_theta }))
    }

    /// Store-nothing gradient pass; returns `(dX, X, grads)`
    pub fn backward(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor, CouplingGrads)> {
        let state = self.recompute(y)?;
        let (dx, grads) = self.gradient(&state, dy)?;
        Ok((dx, state.x, grads))
    }

    /// Reverse-direction gradient: pull a cotangent at the input side
    /// through the inverse map, returning `(dY, Y, grads)`
    pub fn backward_inv(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor, CouplingGrads)> {
        ensure_same_shape("input cotangent vs input", dx, x)?;
        let (d_mixed, x_mixed) = self.mixing.forward_adjoint(dx, x)?;
        let (dx1, dx2) = split_channels(&d_mixed, self.mask.as_ref())?;
        let (x1, x2) = split_channels(&x_mixed, self.mask.as_ref())?;

        let t = self.predictor.forward(&x1)?;
        let z2 = &x2 + &t;

        // inverse map: X2 = Z2 - T(Z1), so the cotangent entering the
        // predictor is the negated shift-branch cotangent
        let (dp, d_theta) = self.predictor.backward(&(-&dx2), &x1)?;
        let dz1 = &dx1 + &dp;
        let dz2 = dx2;

        let z = concat_channels(&x1, &z2, self.mask.as_ref())?;
        let dz = concat_channels(&dz1, &dz2, self.mask.as_ref())?;
        let (dy, y) = self.mixing.inverse_adjoint(&dz, &z)?;
        Ok((dy, y, CouplingGrads { predictor: d_theta }))
    }

    /// Forward-mode linearization along the same control path as
    /// [`forward`](Self::forward)
    ///
    /// The exit traversal uses the contract's guarantee that the mixing
    /// is linear in its input: with `Z = Mixing(Y)` the tangents satisfy
    /// `dZ = J_x dY + J_theta dtheta`, so
    /// `dY = Mixing^-1(dZ - J_theta dtheta)` with the parameter part read
    /// off `Mixing::jacobian` at a zero input tangent.
    pub fn jacobian(&self, dx: &Tensor, dtheta: &ParamTangent, x: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure_same_shape("input tangent vs input", dx, x)?;
        let (dx_mixed, x_mixed) = self.mixing.jacobian(dx, &dtheta.mixing, x)?;
        let (x1, x2) = split_channels(&x_mixed, self.mask.as_ref())?;
        let (dx1, dx2) = split_channels(&dx_mixed, self.mask.as_ref())?;

        let (dt, t) = self.predictor.jacobian(&dx1, &dtheta.predictor, &x1)?;
        let z2 = &x2 + &t;
        let dz2 = &dx2 + &dt;

        let z = concat_channels(&x1, &z2, self.mask.as_ref())?;
        let dz = concat_channels(&dx1, &dz2, self.mask.as_ref())?;

        let y = self.mixing.inverse(&z)?;
        let dy = if dtheta.mixing.is_empty() {
            self.mixing.inverse(&dz)?
        } else {
            let zeros = Tensor::zeros(y.raw_dim());
            let (param_tan, _) = self.mixing.jacobian(&zeros, &dtheta.mixing, &y)?;
            self.mixing.inverse(&(&dz - &param_tan))?
        };
        Ok((dy, y))
    }

    /// The VJP dual of [`jacobian`](Self::jacobian)
    pub fn adjoint_jacobian(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, CouplingGrads)> {
        let state = self.recompute(y)?;
        self.gradient(&state, dy)
    }
}

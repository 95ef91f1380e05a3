//! # Collaborator contracts
//!
//! The coupling engines are generic over three capability contracts. Any
//! concrete implementation satisfying a contract can be substituted; the
//! engines themselves never inspect collaborator internals.
//!
//! Adjoint convention used throughout (the "paired" form): each adjoint
//! call consumes a cotangent together with the point it is anchored at,
//! and returns the propagated cotangent together with the recomputed
//! image of that point, so a gradient pass regenerates activations as a
//! byproduct instead of storing them.

use std::fmt;

use crate::error::Result;
use crate::tensor::Tensor;

/// Invertible (volume-preserving) linear recombination of channels
///
/// Applied before the coupling split and, for the round-trip variant,
/// inverted again after the combine step.
pub trait MixingTransform {
    /// Mix channels: `X -> X'`
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Unmix channels: `X' -> X`; exact inverse of [`forward`](Self::forward)
    fn inverse(&self, y: &Tensor) -> Result<Tensor>;

    /// Paired adjoint of `inverse`: given a cotangent `dx` at the unmixed
    /// side and the unmixed point `x`, return the cotangent pulled to the
    /// mixed side along with `forward(x)`
    fn forward_adjoint(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Paired adjoint of `forward`: given a cotangent `dy` at the mixed
    /// side and the mixed point `y`, return the cotangent pulled to the
    /// unmixed side along with `inverse(y)`
    fn inverse_adjoint(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Forward-mode linearization of `forward` at `x`: propagate an input
    /// tangent `dx` and a parameter direction `dtheta` (empty slice means
    /// no parameter perturbation), returning `(dY, Y)`
    fn jacobian(&self, dx: &Tensor, dtheta: &[f64], x: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Number of trainable parameters
    fn num_params(&self) -> usize {
        0
    }

    /// Flat view of the trainable parameters
    fn params(&self) -> Vec<f64> {
        Vec::new()
    }

    /// Drop any internally accumulated parameter gradient
    ///
    /// The reference implementations in this crate accumulate nothing and
    /// keep the default no-op.
    fn clear_grad(&mut self) {}
}

/// Parameterized differentiable map from one channel half to raw
/// scale/shift (fan-out mode) or shift-only values
pub trait Predictor {
    /// `X -> raw`, where `raw` has `fan_out() * channels(X)` channels
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Vector-Jacobian product at `x`: pull the cotangent `d_raw` back to
    /// the input and return the flat parameter-gradient contribution by
    /// value (nothing is accumulated internally)
    fn backward(&self, d_raw: &Tensor, x: &Tensor) -> Result<(Tensor, Vec<f64>)>;

    /// Forward-mode linearization at `x`: propagate an input tangent `dx`
    /// and a parameter direction `dtheta` (empty slice means none),
    /// returning `(d_raw, raw)`
    fn jacobian(&self, dx: &Tensor, dtheta: &[f64], x: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Output-width multiple: 2 in fan-out (affine) mode, 1 in additive mode
    fn fan_out(&self) -> usize;

    /// Number of trainable parameters
    fn num_params(&self) -> usize;

    /// Flat view of the trainable parameters
    fn params(&self) -> Vec<f64>;

    /// Overwrite the trainable parameters from a flat slice
    fn set_params(&mut self, params: &[f64]) -> Result<()>;
}

/// Bounded elementwise nonlinearity turning raw predictor outputs into
/// strictly positive scale factors
///
/// The Jacobian is diagonal, so [`backward`](Self::backward) serves as
/// both the VJP and the JVP: either way it multiplies elementwise by the
/// derivative, expressed through the already-computed output `s`.
pub trait ActivationGate: fmt::Debug {
    /// `logS -> S`, with `S` in the gate's codomain for every element
    fn forward(&self, log_s: &Tensor) -> Tensor;

    /// Multiply `d_s` elementwise by `dS/dlogS`, evaluated from `s`
    fn backward(&self, d_s: &Tensor, s: &Tensor) -> Tensor;
}

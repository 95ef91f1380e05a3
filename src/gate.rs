//! # Activation gates
//!
//! Bounded elementwise nonlinearities mapping raw predictor outputs to
//! scale factors. Bounded gates keep the affine transform well away from
//! the degenerate zero-scale regime during early training.

use serde::{Deserialize, Serialize};

use crate::contract::ActivationGate;
use crate::tensor::Tensor;

/// Logistic gate: `S = 1 / (1 + exp(-logS))`, codomain (0, 1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SigmoidGate;

impl ActivationGate for SigmoidGate {
    fn forward(&self, log_s: &Tensor) -> Tensor {
        log_s.mapv(|v| 1.0 / (1.0 + (-v).exp()))
    }

    fn backward(&self, d_s: &Tensor, s: &Tensor) -> Tensor {
        // dS/dlogS = S (1 - S)
        d_s * &s.mapv(|v| v * (1.0 - v))
    }
}

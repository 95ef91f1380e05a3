//! # Gradient accumulation buffers
//!
//! Parameter gradients are never hidden inside collaborators: every
//! gradient-mode operation returns its contribution by value, and callers
//! merge contributions into an explicit [`GradAccumulator`]. This keeps
//! `backward` free of shared mutable state (a single layer can be driven
//! from several places without reentrancy hazards) and makes "reset"
//! an explicit operation instead of a side channel.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// One gradient call's parameter-gradient contribution
///
/// Field order matches the owning predictor's flat `params()` layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CouplingGrads {
    /// Predictor parameter gradient, flat
    pub predictor: Vec<f64>,
}

impl CouplingGrads {
    /// Zero contribution for a predictor with `n` parameters
    pub fn zeros(n: usize) -> Self {
        Self {
            predictor: vec![0.0; n],
        }
    }

    /// Inner product with a parameter direction of the same length
    pub fn dot(&self, direction: &[f64]) -> f64 {
        self.predictor
            .iter()
            .zip(direction)
            .map(|(g, d)| g * d)
            .sum()
    }
}

/// Running sum of [`CouplingGrads`] contributions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradAccumulator {
    grads: Vec<f64>,
}

impl GradAccumulator {
    /// Accumulator for a predictor with `num_params` parameters
    pub fn new(num_params: usize) -> Self {
        Self {
            grads: vec![0.0; num_params],
        }
    }

    /// Add one contribution; errors if the lengths disagree
    pub fn absorb(&mut self, contribution: &CouplingGrads) -> Result<()> {
        if contribution.predictor.len() != self.grads.len() {
            return Err(FlowError::Dimension(format!(
                "gradient contribution has {} entries, accumulator {}",
                contribution.predictor.len(),
                self.grads.len()
            )));
        }
        for (acc, g) in self.grads.iter_mut().zip(&contribution.predictor) {
            *acc += g;
        }
        Ok(())
    }

    /// Zero the accumulated gradient in place
    pub fn reset(&mut self) {
        for g in &mut self.grads {
            *g = 0.0;
        }
    }

    /// Accumulated gradient, flat
    pub fn as_slice(&self) -> &[f64] {
        &self.grads
    }
}

/// Parameter directions for forward-mode linearization
///
/// Empty vectors mean "no perturbation" for that collaborator; non-empty
/// vectors must match the collaborator's `num_params`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamTangent {
    /// Mixing-transform parameter direction
    pub mixing: Vec<f64>,
    /// Predictor parameter direction
    pub predictor: Vec<f64>,
}

impl ParamTangent {
    /// No parameter perturbation at all
    pub fn zero() -> Self {
        Self::default()
    }

    /// Predictor-only direction
    pub fn predictor(direction: Vec<f64>) -> Self {
        Self {
            mixing: Vec::new(),
            predictor: direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_and_reset() {
        let mut acc = GradAccumulator::new(3);
        acc.absorb(&CouplingGrads {
            predictor: vec![1.0, 2.0, 3.0],
        })
        .unwrap();
        acc.absorb(&CouplingGrads {
            predictor: vec![0.5, 0.5, 0.5],
        })
        .unwrap();
        assert_eq!(acc.as_slice(), &[1.5, 2.5, 3.5]);
        acc.reset();
        assert_eq!(acc.as_slice(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_absorb_length_mismatch() {
        let mut acc = GradAccumulator::new(2);
        let err = acc.absorb(&CouplingGrads {
            predictor: vec![1.0],
        });
        assert!(err.is_err());
    }
}

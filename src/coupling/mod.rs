//! # Coupling layer engines
//!
//! Two exactly invertible coupling variants built from the collaborator
//! contracts:
//! - [`CouplingLayer`]: affine or additive general coupling. The mixing
//!   transform is applied once at entry; the output lives in the mixed
//!   domain and `inverse` handles it symmetrically.
//! - [`RimCouplingLayer`]: additive round-trip coupling. The mixing
//!   transform is applied forward at entry and inverted again at exit,
//!   so every gradient path traverses it twice.
//!
//! Both engines are stateless pure functions over tensors: the gradient
//! pass reconstructs intermediate activations from the output by calling
//! the exact inverse instead of storing them.

mod glow;
mod rim;

pub use glow::{CouplingLayer, CouplingState, CouplingVariant, JacobianOutput};
pub use rim::{RimCouplingLayer, RimState};

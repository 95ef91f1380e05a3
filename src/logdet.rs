//! # Log-determinant utilities
//!
//! An affine coupling layer scales half of its channels elementwise, so
//! the log of the absolute Jacobian determinant is just the sum of
//! `log|S|` over all scaled elements. The statistic here is normalized
//! by batch size; the gradient below must stay in sync with that choice.

use crate::tensor::Tensor;

/// Batch-normalized log-determinant of an elementwise scale factor:
/// `sum(log|S|) / batch_size`
pub fn scale_logdet(s: &Tensor, batch_size: usize) -> f64 {
    s.mapv(|v| v.abs().ln()).sum() / batch_size as f64
}

/// Analytic gradient of [`scale_logdet`] with respect to `S`:
/// `1 / (S * batch_size)` elementwise
pub fn scale_logdet_grad(s: &Tensor, batch_size: usize) -> Tensor {
    s.mapv(|v| 1.0 / (v * batch_size as f64))
}

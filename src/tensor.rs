//! # Tensor layout and channel split/concat
//!
//! Every tensor in this crate is a dense N-dimensional `f64` array with
//! axis 0 as the batch axis and axis 1 as the channel axis; any further
//! axes are spatial. This module provides the channel partitioning
//! primitives the coupling layers are built on:
//! - contiguous half split / concat
//! - masked split / concat with an arbitrary boolean channel mask
//! - folding a tensor to a `(channels, batch * spatial)` matrix and back

use ndarray::{Array2, ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Dense N-dimensional tensor: `(batch, channels, spatial...)`
pub type Tensor = ArrayD<f64>;

/// Batch axis index
pub const BATCH_AXIS: usize = 0;
/// Channel axis index
pub const CHANNEL_AXIS: usize = 1;

/// Batch size of a tensor
pub fn batch_size(x: &Tensor) -> usize {
    x.shape()[BATCH_AXIS]
}

/// Channel count of a tensor
pub fn channels(x: &Tensor) -> usize {
    x.shape()[CHANNEL_AXIS]
}

/// Boolean channel selector for non-contiguous coupling splits
///
/// `true` marks a channel for the first split group; within-group order
/// follows the original channel order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMask {
    mask: Vec<bool>,
}

impl ChannelMask {
    /// Create a mask from explicit per-channel flags
    pub fn new(mask: Vec<bool>) -> Result<Self> {
        if mask.is_empty() {
            return Err(FlowError::Configuration(
                "channel mask must cover at least one channel".into(),
            ));
        }
        Ok(Self { mask })
    }

    /// Mask selecting even channel indices {0, 2, 4, ...}
    pub fn even(channels: usize) -> Result<Self> {
        Self::new((0..channels).map(|i| i % 2 == 0).collect())
    }

    /// Mask selecting odd channel indices {1, 3, 5, ...}
    pub fn odd(channels: usize) -> Result<Self> {
        Self::new((0..channels).map(|i| i % 2 == 1).collect())
    }

    /// Total number of channels covered by the mask
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Whether the mask covers zero channels
    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Number of selected (`true`) channels
    pub fn selected_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Whether the mask selects exactly half of its channels
    pub fn is_balanced(&self) -> bool {
        2 * self.selected_count() == self.len()
    }

    /// Indices of selected channels, in original order
    pub fn selected(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of unselected channels, in original order
    pub fn unselected(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| !m)
            .map(|(i, _)| i)
            .collect()
    }
}

fn check_rank(x: &Tensor) -> Result<()> {
    if x.ndim() < 2 {
        return Err(FlowError::Dimension(format!(
            "tensor must have batch and channel axes, got {} axes",
            x.ndim()
        )));
    }
    Ok(())
}

/// Partition a tensor into two channel groups
///
/// Without a mask this is the contiguous halves split (first `C/2`
/// channels vs. the rest; `C` must be even). With a mask, the selected
/// channels form the first group and the unselected channels the second,
/// both preserving original channel order.
pub fn split_channels(x: &Tensor, mask: Option<&ChannelMask>) -> Result<(Tensor, Tensor)> {
    check_rank(x)?;
    let c = channels(x);
    match mask {
        None => {
            if c % 2 != 0 {
                return Err(FlowError::Dimension(format!(
                    "contiguous split requires an even channel count, got {c}"
                )));
            }
            let half = c / 2;
            let a = x
                .slice_axis(Axis(CHANNEL_AXIS), Slice::from(..half))
                .to_owned();
            let b = x
                .slice_axis(Axis(CHANNEL_AXIS), Slice::from(half..))
                .to_owned();
            Ok((a, b))
        }
        Some(m) => {
            if m.len() != c {
                return Err(FlowError::Dimension(format!(
                    "channel mask covers {} channels but tensor has {c}",
                    m.len()
                )));
            }
            let a = x.select(Axis(CHANNEL_AXIS), &m.selected());
            let b = x.select(Axis(CHANNEL_AXIS), &m.unselected());
            Ok((a, b))
        }
    }
}

/// Reassemble two channel groups into one tensor
///
/// Exact inverse of [`split_channels`]: `split(concat(a, b, m), m)`
/// returns `(a, b)` bit-for-bit for any compatible `a`, `b`.
pub fn concat_channels(a: &Tensor, b: &Tensor, mask: Option<&ChannelMask>) -> Result<Tensor> {
    check_rank(a)?;
    check_rank(b)?;
    let ca = channels(a);
    let cb = channels(b);
    if a.ndim() != b.ndim()
        || a.shape()
            .iter()
            .zip(b.shape())
            .enumerate()
            .any(|(ax, (da, db))| ax != CHANNEL_AXIS && da != db)
    {
        return Err(FlowError::Dimension(format!(
            "cannot concat shapes {:?} and {:?} along the channel axis",
            a.shape(),
            b.shape()
        )));
    }

    let (idx_a, idx_b) = match mask {
        None => ((0..ca).collect::<Vec<_>>(), (ca..ca + cb).collect::<Vec<_>>()),
        Some(m) => {
            if m.selected_count() != ca || m.len() != ca + cb {
                return Err(FlowError::Dimension(format!(
                    "channel mask selects {} of {} channels, but groups have {ca} and {cb}",
                    m.selected_count(),
                    m.len()
                )));
            }
            (m.selected(), m.unselected())
        }
    };

    let shape = shape_with_channels(a.shape(), ca + cb);
    let mut out = Tensor::zeros(IxDyn(&shape));
    for (k, &ch) in idx_a.iter().enumerate() {
        out.index_axis_mut(Axis(CHANNEL_AXIS), ch)
            .assign(&a.index_axis(Axis(CHANNEL_AXIS), k));
    }
    for (k, &ch) in idx_b.iter().enumerate() {
        out.index_axis_mut(Axis(CHANNEL_AXIS), ch)
            .assign(&b.index_axis(Axis(CHANNEL_AXIS), k));
    }
    Ok(out)
}

/// Shape equal to `shape` with the channel axis replaced by `c`
pub(crate) fn shape_with_channels(shape: &[usize], c: usize) -> Vec<usize> {
    let mut s = shape.to_vec();
    s[CHANNEL_AXIS] = c;
    s
}

/// Check two tensors agree in shape; `what` names the pairing in errors
pub(crate) fn ensure_same_shape(what: &str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(FlowError::Dimension(format!(
            "{what}: shapes {:?} and {:?} differ",
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

/// Fold a tensor into a `(channels, batch * spatial)` matrix
///
/// Columns enumerate batch and spatial positions in row-major order, so
/// a per-position channel map becomes a plain matrix product.
pub(crate) fn to_channel_matrix(x: &Tensor) -> Array2<f64> {
    let c = channels(x);
    let cols = x.len() / c;
    let mut axes: Vec<usize> = (0..x.ndim()).collect();
    axes.swap(BATCH_AXIS, CHANNEL_AXIS);
    let data: Vec<f64> = x.view().permuted_axes(axes).iter().copied().collect();
    Array2::from_shape_vec((c, cols), data).expect("channel matrix shape is consistent")
}

/// Unfold a `(channels, batch * spatial)` matrix back into tensor `shape`
///
/// `shape[CHANNEL_AXIS]` must equal the matrix row count.
pub(crate) fn from_channel_matrix(m: &Array2<f64>, shape: &[usize]) -> Tensor {
    let mut pshape = shape.to_vec();
    pshape.swap(BATCH_AXIS, CHANNEL_AXIS);
    let data: Vec<f64> = m.iter().copied().collect();
    let arr =
        ArrayD::from_shape_vec(IxDyn(&pshape), data).expect("channel matrix shape is consistent");
    let mut axes: Vec<usize> = (0..shape.len()).collect();
    axes.swap(BATCH_AXIS, CHANNEL_AXIS);
    arr.permuted_axes(axes).as_standard_layout().to_owned()
}

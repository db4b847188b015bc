//! Convolutional 2D subsampling (to 1/4 length).

use candle_core::{Result, Tensor, D};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

use crate::config::WhaleConfig;

/// Conv2D subsampling block.
///
/// Two unpadded kernel-3 stride-2 convolutions over a single-channel view
/// of the feature matrix, each followed by ReLU, then a linear projection
/// of the flattened channel/frequency axes to `hidden_size`. Time and
/// frequency each shrink to `(n - 1) / 2` per conv, so the time axis ends
/// up at roughly a quarter of the input length.
#[derive(Debug, Clone)]
pub struct Conv2dSubsampling4 {
    conv1: Conv2d,
    conv2: Conv2d,
    out: Linear,
}

impl Conv2dSubsampling4 {
    pub fn new(config: &WhaleConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let cfg = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };

        // Tensor names mirror the checkpoint's nn.Sequential layout
        // (conv_in.0, conv_in.2 with the ReLUs at odd indices).
        let conv1 = conv2d(config.num_channels, hidden_size, 3, cfg, vb.pp("conv_in.0"))?;
        let conv2 = conv2d(hidden_size, hidden_size, 3, cfg, vb.pp("conv_in.2"))?;
        let out = linear(
            config.subsampling_intermediate_size(),
            hidden_size,
            vb.pp("out"),
        )?;

        Ok(Self { conv1, conv2, out })
    }

    /// Subsampling factor along the time axis.
    pub fn subsampling_rate(&self) -> usize {
        4
    }

    /// Right context in input frames: `(3 - 1) * 1 + (3 - 1) * 2`.
    pub fn right_context(&self) -> usize {
        6
    }

    /// Subsample the features and the frame mask.
    ///
    /// # Arguments
    /// * `x` - features of shape `(batch, time, input_dim)`
    /// * `x_mask` - mask of shape `(batch, 1, time)`, nonzero = valid frame
    ///
    /// # Returns
    /// `(features (batch, time', hidden_size), mask (batch, 1, time'))`
    /// where `time' = ((time - 1) / 2 - 1) / 2`.
    ///
    /// The mask is downsampled by taking every second time index starting
    /// at 2, twice, mirroring the convs' effective stride. This is an
    /// approximation of the exact conv output length; for most lengths the
    /// two agree, but it is not re-derived from conv arithmetic.
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let x = x.unsqueeze(1)?; // (b, c=1, t, f)
        let x = self.conv1.forward(&x)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;

        let (b, c, t, f) = x.dims4()?;
        let x = x.transpose(1, 2)?.contiguous()?.reshape((b, t, c * f))?;
        let x = self.out.forward(&x)?;

        let mask = subsample_mask(x_mask)?;
        let mask = subsample_mask(&mask)?;
        Ok((x, mask))
    }
}

/// Take every second element of the time axis starting at index 2.
fn subsample_mask(mask: &Tensor) -> Result<Tensor> {
    let time = mask.dim(D::Minus1)?;
    let indices: Vec<u32> = (2..time as u32).step_by(2).collect();
    let len = indices.len();
    let indices = Tensor::from_vec(indices, len, mask.device())?;
    mask.index_select(&indices, 2)
}

//! Sinusoidal positional encoding (absolute and relative variants).

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::Dropout;

use crate::config::WhaleConfig;

/// Which flavour of positional information the encoder produces.
///
/// `Absolute` adds the sinusoidal slice to the input; `Relative` keeps the
/// input and the slice separate so attention can use the slice as a
/// Transformer-XL style bias term (see [`crate::layers::Attention`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalKind {
    Absolute,
    Relative,
}

/// Sinusoidal positional encoding.
///
/// The table is a deterministic function of position and dimension,
/// precomputed once at construction and never learned:
///
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d))
/// ```
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// Precomputed table of shape `(1, max_len, hidden_size)`.
    pe: Tensor,
    /// Input scale, `sqrt(hidden_size)`.
    xscale: f64,
    dropout: Dropout,
    max_len: usize,
    kind: PositionalKind,
}

impl PositionalEncoding {
    /// Absolute variant: the positional slice is added to the input.
    pub fn absolute(config: &WhaleConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::new(PositionalKind::Absolute, config, device, dtype)
    }

    /// Relative variant: the positional slice is returned separately.
    pub fn relative(config: &WhaleConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::new(PositionalKind::Relative, config, device, dtype)
    }

    fn new(
        kind: PositionalKind,
        config: &WhaleConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let d_model = config.hidden_size;
        if d_model % 2 != 0 {
            bail!("positional encoding needs an even hidden size (got {d_model})");
        }
        let max_len = config.max_position_embeddings;

        // Table built on the host in f32 and cast to the model dtype.
        let mut data = vec![0.0_f32; max_len * d_model];
        for pos in 0..max_len {
            for i in 0..d_model / 2 {
                let div_term =
                    (-(10000.0_f64).ln() * (2 * i) as f64 / d_model as f64).exp();
                let angle = pos as f64 * div_term;
                data[pos * d_model + 2 * i] = angle.sin() as f32;
                data[pos * d_model + 2 * i + 1] = angle.cos() as f32;
            }
        }
        let pe = Tensor::from_vec(data, (1, max_len, d_model), device)?.to_dtype(dtype)?;

        Ok(Self {
            pe,
            xscale: (d_model as f64).sqrt(),
            dropout: Dropout::new(config.dropout),
            max_len,
            kind,
        })
    }

    /// Apply positional encoding.
    ///
    /// `x` has shape `(batch, time, hidden_size)`; `offset` is the starting
    /// frame index for streaming use. Fails when `offset + time` runs past
    /// the precomputed table.
    ///
    /// Returns `(encoded, pos_emb)`: for the absolute variant `encoded` is
    /// `x * sqrt(d) + pos_emb`, for the relative variant it is just
    /// `x * sqrt(d)`. Dropout is applied to both tensors independently.
    pub fn forward(&self, x: &Tensor, offset: usize, train: bool) -> Result<(Tensor, Tensor)> {
        let (_batch, time, _dim) = x.dims3()?;
        if offset + time >= self.max_len {
            bail!(
                "position offset {offset} + sequence length {time} exceeds max_position_embeddings {}",
                self.max_len
            );
        }

        let pos_emb = self.pe.narrow(1, offset, time)?;
        let x = (x * self.xscale)?;
        let x = match self.kind {
            PositionalKind::Absolute => x.broadcast_add(&pos_emb)?,
            PositionalKind::Relative => x,
        };

        Ok((
            self.dropout.forward(&x, train)?,
            self.dropout.forward(&pos_emb, train)?,
        ))
    }

    /// Positional slice for a streaming window, without touching the input.
    ///
    /// Note: in a streaming scenario this gets called repeatedly with
    /// growing windows, so in training mode dropout is re-applied on every
    /// call rather than once per utterance.
    pub fn position_encoding(&self, offset: usize, size: usize, train: bool) -> Result<Tensor> {
        if offset + size >= self.max_len {
            bail!(
                "position offset {offset} + size {size} exceeds max_position_embeddings {}",
                self.max_len
            );
        }
        self.dropout.forward(&self.pe.narrow(1, offset, size)?, train)
    }

    /// Maximum number of positions in the table.
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WhaleConfig {
        WhaleConfig {
            hidden_size: 8,
            num_attention_heads: 2,
            max_position_embeddings: 16,
            dropout: 0.0,
            ..WhaleConfig::whale_base()
        }
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn test_table_matches_sinusoid_formula() {
        let config = test_config();
        let enc =
            PositionalEncoding::absolute(&config, &Device::Cpu, DType::F32).unwrap();
        let table = enc.position_encoding(0, 16, false).unwrap();
        let table = table.squeeze(0).unwrap().to_vec2::<f32>().unwrap();

        let d = config.hidden_size;
        for (pos, row) in table.iter().enumerate() {
            for i in 0..d / 2 {
                let angle = pos as f64 / 10000.0_f64.powf((2 * i) as f64 / d as f64);
                assert!((row[2 * i] - angle.sin() as f32).abs() < 1e-5);
                assert!((row[2 * i + 1] - angle.cos() as f32).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_absolute_adds_relative_does_not() {
        let config = test_config();
        let device = Device::Cpu;
        let x = Tensor::ones((1, 4, 8), DType::F32, &device).unwrap();

        let abs = PositionalEncoding::absolute(&config, &device, DType::F32).unwrap();
        let rel = PositionalEncoding::relative(&config, &device, DType::F32).unwrap();

        let (abs_out, abs_pos) = abs.forward(&x, 0, false).unwrap();
        let (rel_out, rel_pos) = rel.forward(&x, 0, false).unwrap();

        // Relative output is only the scaled input.
        let scaled = (&x * (8.0_f64).sqrt()).unwrap();
        assert_close(&rel_out, &scaled);

        // Absolute output additionally carries the positional slice.
        let recombined = scaled.broadcast_add(&abs_pos).unwrap();
        assert_close(&abs_out, &recombined);

        // Both variants expose the same table slice.
        assert_close(&abs_pos, &rel_pos);
    }

    #[test]
    fn test_offset_out_of_range_fails() {
        let config = test_config();
        let enc =
            PositionalEncoding::relative(&config, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();

        assert!(enc.forward(&x, 0, false).is_ok());
        assert!(enc.forward(&x, 12, false).is_err()); // 12 + 4 >= 16
        assert!(enc.position_encoding(14, 2, false).is_err());
    }

    #[test]
    fn test_streaming_slice_matches_forward_slice() {
        let config = test_config();
        let enc =
            PositionalEncoding::relative(&config, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::zeros((1, 6, 8), DType::F32, &Device::Cpu).unwrap();

        let (_out, pos) = enc.forward(&x, 3, false).unwrap();
        let streamed = enc.position_encoding(3, 6, false).unwrap();
        assert_close(&pos, &streamed);
    }
}

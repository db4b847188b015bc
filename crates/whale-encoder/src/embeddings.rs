//! Audio embeddings: projection, normalization and positional encoding.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder};

use crate::config::WhaleConfig;
use crate::layers::LayerNorm;
use crate::position::PositionalEncoding;

/// Embedding block applied to subsampled features.
///
/// Linear projection -> LayerNorm -> dropout -> ReLU, followed by the
/// relative positional encoder. Produces the `(hidden_states, pos_emb)`
/// pair that attention consumes.
#[derive(Debug, Clone)]
pub struct AudioEmbeddings {
    linear: Linear,
    norm: LayerNorm,
    dropout: Dropout,
    positional_embedding: PositionalEncoding,
}

impl AudioEmbeddings {
    pub fn new(
        config: &WhaleConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let embed_dim = config.hidden_size;
        // Checkpoint names follow the nn.Sequential layout: the linear at
        // embedding.0, the LayerNorm at embedding.1.
        let linear = linear(config.hidden_size, embed_dim, vb.pp("embedding.0"))?;
        let norm = LayerNorm::new(embed_dim, config.layer_norm_eps, vb.pp("embedding.1"))?;
        let positional_embedding = PositionalEncoding::relative(config, device, dtype)?;

        Ok(Self {
            linear,
            norm,
            dropout: Dropout::new(config.dropout),
            positional_embedding,
        })
    }

    /// Embed subsampled features.
    ///
    /// Returns `(hidden_states, pos_emb)`, both required by the encoder's
    /// relative-position attention.
    pub fn forward(&self, input_features: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let h = self.linear.forward(input_features)?;
        let h = self.norm.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        let h = h.relu()?;
        self.positional_embedding.forward(&h, 0, train)
    }

    /// Positional slice for externally produced embeddings.
    pub fn position_encoding(&self, offset: usize, size: usize, train: bool) -> Result<Tensor> {
        self.positional_embedding.position_encoding(offset, size, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WhaleConfig {
        WhaleConfig {
            hidden_size: 16,
            num_attention_heads: 4,
            intermediate_size: 32,
            input_dim: 21,
            max_position_embeddings: 64,
            dropout: 0.0,
            ..WhaleConfig::whale_base()
        }
    }

    #[test]
    fn test_embeddings_output_pair() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let config = test_config();
        let emb = AudioEmbeddings::new(&config, vb, &device, DType::F32).unwrap();

        let x = Tensor::zeros((2, 10, 16), DType::F32, &device).unwrap();
        let (h, pos) = emb.forward(&x, false).unwrap();
        assert_eq!(h.dims(), &[2, 10, 16]);
        assert_eq!(pos.dims(), &[1, 10, 16]);
    }
}

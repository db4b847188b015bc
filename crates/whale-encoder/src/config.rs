//! Configuration for the Whale encoder.

use candle_nn::Activation;
use serde::{Deserialize, Serialize};
use std::path::Path;

use whale_core::{WhaleError, WhaleResult};

/// Configuration for the Whale audio encoder.
///
/// Field names follow the HuggingFace `audio_config` section of the Whale
/// checkpoint so that [`WhaleConfig::from_hf_config`] can read a stock
/// `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleConfig {
    /// Model dimension (hidden size).
    pub hidden_size: usize,

    /// Number of transformer encoder layers.
    pub num_hidden_layers: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Feed-forward network intermediate dimension.
    pub intermediate_size: usize,

    /// Input acoustic feature dimension (e.g. number of filterbank bins).
    pub input_dim: usize,

    /// Input channel count for the subsampling convolutions.
    pub num_channels: usize,

    /// Maximum number of positions in the sinusoidal table.
    pub max_position_embeddings: usize,

    /// Dropout probability (0.0 for inference).
    pub dropout: f32,

    /// Dropout probability on attention weights.
    pub attention_dropout: f32,

    /// Layer normalization epsilon.
    pub layer_norm_eps: f64,

    /// Activation function name ("relu", "gelu", ...).
    pub hidden_act: String,

    /// Pre-norm (`true`) vs post-norm (`false`) layer ordering.
    pub normalize_before: bool,

    /// Concatenate the attention output with its input and project back
    /// down instead of plain residual addition.
    pub concat_after: bool,

    /// Use Transformer-XL style relative positional bias in attention.
    pub use_relative_pe: bool,

    /// Apply LayerNorm to projected queries and keys.
    pub qk_normalization: bool,

    /// Request the fused flash-attention kernel when available.
    pub use_flash_attn: bool,

    /// HF-config compatibility flag; recompute-on-backward is not
    /// implemented by this runtime (see `Encoder::new`).
    pub gradient_checkpointing: bool,

    /// Capture every intermediate hidden state by default.
    pub output_hidden_states: bool,
}

impl Default for WhaleConfig {
    fn default() -> Self {
        Self::whale_base()
    }
}

impl WhaleConfig {
    /// Configuration of the Whale base encoder.
    pub fn whale_base() -> Self {
        Self {
            hidden_size: 1024,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            intermediate_size: 4096,
            input_dim: 80,
            num_channels: 1,
            max_position_embeddings: 5000,
            dropout: 0.1,
            attention_dropout: 0.0,
            layer_norm_eps: 1e-5,
            hidden_act: "relu".to_string(),
            normalize_before: true,
            concat_after: false,
            use_relative_pe: true,
            qk_normalization: false,
            use_flash_attn: false,
            gradient_checkpointing: false,
            output_hidden_states: false,
        }
    }

    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Flattened conv output dimension fed to the subsampling projection:
    /// `hidden_size * (((input_dim - 1) / 2 - 1) / 2)`.
    pub fn subsampling_intermediate_size(&self) -> usize {
        self.hidden_size * (((self.input_dim - 1) / 2 - 1) / 2)
    }

    /// Resolve the configured activation function by name.
    pub fn activation(&self) -> WhaleResult<Activation> {
        match self.hidden_act.as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::NewGelu),
            "silu" | "swish" => Ok(Activation::Silu),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(WhaleError::Config(format!(
                "unknown activation function `{other}`"
            ))),
        }
    }

    /// Validate the configuration invariants.
    ///
    /// Called eagerly by `WhaleAudioModel::new` so that a bad config fails
    /// at construction rather than as a tensor shape error mid-forward.
    pub fn validate(&self) -> WhaleResult<()> {
        if self.num_attention_heads == 0 {
            return Err(WhaleError::Config(
                "num_attention_heads must be non-zero".to_string(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(WhaleError::Config(format!(
                "hidden_size must be divisible by num_attention_heads (got hidden_size: {} and num_attention_heads: {})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.hidden_size % 2 != 0 {
            return Err(WhaleError::Config(format!(
                "hidden_size must be even for the sinusoidal positional table (got {})",
                self.hidden_size
            )));
        }
        // Two unpadded kernel-3 stride-2 convs need at least 7 input bins
        // to leave a non-empty frequency axis.
        if self.input_dim < 7 {
            return Err(WhaleError::Config(format!(
                "input_dim must be at least 7 for 4x conv subsampling (got {})",
                self.input_dim
            )));
        }
        if self.max_position_embeddings == 0 {
            return Err(WhaleError::Config(
                "max_position_embeddings must be non-zero".to_string(),
            ));
        }
        for (name, p) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(WhaleError::Config(format!(
                    "{name} must be within [0, 1] (got {p})"
                )));
            }
        }
        self.activation()?;
        Ok(())
    }

    /// Load configuration from a HuggingFace `config.json`.
    ///
    /// Looks for an `audio_config` section first and falls back to the
    /// document root, filling absent fields with `whale_base` defaults.
    pub fn from_hf_config(path: impl AsRef<Path>) -> WhaleResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let audio = value.get("audio_config").unwrap_or(&value);

        let defaults = Self::whale_base();
        let get_usize = |key: &str, default: usize| -> usize {
            audio
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(default)
        };
        let get_bool = |key: &str, default: bool| -> bool {
            audio.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
        };
        let get_f64 = |key: &str, default: f64| -> f64 {
            audio.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
        };

        Ok(Self {
            hidden_size: get_usize("hidden_size", defaults.hidden_size),
            num_hidden_layers: get_usize("num_hidden_layers", defaults.num_hidden_layers),
            num_attention_heads: get_usize("num_attention_heads", defaults.num_attention_heads),
            intermediate_size: get_usize("intermediate_size", defaults.intermediate_size),
            input_dim: get_usize("input_dim", defaults.input_dim),
            num_channels: get_usize("num_channels", defaults.num_channels),
            max_position_embeddings: get_usize(
                "max_position_embeddings",
                defaults.max_position_embeddings,
            ),
            dropout: get_f64("dropout", defaults.dropout as f64) as f32,
            attention_dropout: get_f64("attention_dropout", defaults.attention_dropout as f64)
                as f32,
            layer_norm_eps: get_f64("layer_norm_eps", defaults.layer_norm_eps),
            hidden_act: audio
                .get("hidden_act")
                .and_then(|v| v.as_str())
                .unwrap_or(&defaults.hidden_act)
                .to_string(),
            normalize_before: get_bool("normalize_before", defaults.normalize_before),
            concat_after: get_bool("concat_after", defaults.concat_after),
            use_relative_pe: get_bool("use_relative_pe", defaults.use_relative_pe),
            qk_normalization: get_bool("qk_normalization", defaults.qk_normalization),
            use_flash_attn: get_bool("use_flash_attn", defaults.use_flash_attn),
            gradient_checkpointing: get_bool(
                "gradient_checkpointing",
                defaults.gradient_checkpointing,
            ),
            output_hidden_states: get_bool("output_hidden_states", defaults.output_hidden_states),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WhaleConfig::default();
        assert_eq!(config.hidden_size, 1024);
        assert_eq!(config.num_hidden_layers, 24);
        assert_eq!(config.num_attention_heads, 16);
        assert!(config.use_relative_pe);
        config.validate().unwrap();
    }

    #[test]
    fn test_head_dim() {
        let config = WhaleConfig::whale_base();
        assert_eq!(config.head_dim(), 64); // 1024 / 16
    }

    #[test]
    fn test_subsampling_intermediate_size() {
        let config = WhaleConfig::whale_base();
        // ((80 - 1) / 2 - 1) / 2 = 19 frequency bins after two convs.
        assert_eq!(config.subsampling_intermediate_size(), 1024 * 19);
    }

    #[test]
    fn test_validate_rejects_indivisible_heads() {
        let config = WhaleConfig {
            num_attention_heads: 13,
            ..WhaleConfig::whale_base()
        };
        assert!(matches!(
            config.validate(),
            Err(WhaleError::Config(msg)) if msg.contains("divisible")
        ));
    }

    #[test]
    fn test_validate_rejects_narrow_input() {
        let config = WhaleConfig {
            input_dim: 5,
            ..WhaleConfig::whale_base()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_activation_by_name() {
        let mut config = WhaleConfig::whale_base();
        assert_eq!(config.activation().unwrap(), Activation::Relu);
        config.hidden_act = "gelu".to_string();
        assert_eq!(config.activation().unwrap(), Activation::Gelu);
        config.hidden_act = "tanhshrink".to_string();
        assert!(config.activation().is_err());
    }
}

//! Encoder stack and the top-level Whale audio model.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use std::path::Path;
use tracing::warn;

use whale_core::{WhaleError, WhaleResult};

use crate::config::WhaleConfig;
use crate::embeddings::AudioEmbeddings;
use crate::layers::{EncoderLayer, LayerNorm};
use crate::subsampling::Conv2dSubsampling4;

/// Stack of transformer encoder layers.
///
/// Applies `num_hidden_layers` encoder layers in sequence, optionally
/// capturing every intermediate hidden state, and finishes with a
/// LayerNorm when the pre-norm ordering is active.
#[derive(Debug, Clone)]
pub struct Encoder {
    layers: Vec<EncoderLayer>,
    /// Final normalization, present in pre-norm configurations.
    layer_norm: Option<LayerNorm>,
}

impl Encoder {
    pub fn new(config: &WhaleConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        if config.gradient_checkpointing {
            warn!("gradient_checkpointing is set but activation recompute is not implemented by this runtime; layers run without it");
        }

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(EncoderLayer::new(config, vb.pp(format!("layers.{i}")))?);
        }
        let layer_norm = if config.normalize_before {
            Some(LayerNorm::new(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("layer_norm"),
            )?)
        } else {
            None
        };

        Ok(Self { layers, layer_norm })
    }

    /// Run the layer stack.
    ///
    /// When `output_hidden_states` is set, returns the hidden state before
    /// every layer plus the final (normalized) one: `num_layers + 1`
    /// tensors in total.
    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        output_hidden_states: bool,
        train: bool,
    ) -> candle_core::Result<(Tensor, Option<Vec<Tensor>>)> {
        let mut encoder_states: Option<Vec<Tensor>> = output_hidden_states.then(Vec::new);
        let mut hidden_states = inputs_embeds.clone();

        for layer in &self.layers {
            if let Some(states) = encoder_states.as_mut() {
                states.push(hidden_states.clone());
            }
            hidden_states = layer.forward(&hidden_states, attention_mask, pos_emb, train)?;
        }

        if let Some(layer_norm) = &self.layer_norm {
            hidden_states = layer_norm.forward(&hidden_states)?;
        }
        if let Some(states) = encoder_states.as_mut() {
            states.push(hidden_states.clone());
        }

        Ok((hidden_states, encoder_states))
    }
}

/// Output of [`WhaleAudioModel::forward`].
#[derive(Debug, Clone)]
pub struct WhaleAudioOutput {
    /// Hidden states of the last encoder layer, `(batch, time', hidden)`.
    pub last_hidden_state: Tensor,
    /// First time step of the last hidden state, `(batch, hidden)`.
    ///
    /// Assumes a distinguished leading token; the model does not validate
    /// that one exists.
    pub pooler_output: Tensor,
    /// Intermediate hidden states, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
}

/// Whale audio model: subsampling -> embeddings -> encoder.
#[derive(Debug, Clone)]
pub struct WhaleAudioModel {
    config: WhaleConfig,
    subsampling: Conv2dSubsampling4,
    embeddings: AudioEmbeddings,
    encoder: Encoder,
    dtype: DType,
}

impl WhaleAudioModel {
    /// Build the model from a VarBuilder.
    pub fn new(
        config: WhaleConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> WhaleResult<Self> {
        config.validate()?;

        let subsampling = Conv2dSubsampling4::new(&config, vb.pp("subsampling"))?;
        let embeddings = AudioEmbeddings::new(&config, vb.pp("embeddings"), device, dtype)?;
        let encoder = Encoder::new(&config, vb.pp("encoder"))?;

        Ok(Self {
            config,
            subsampling,
            embeddings,
            encoder,
            dtype,
        })
    }

    /// Load the model from a single safetensors file.
    pub fn from_safetensors(
        config: WhaleConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> WhaleResult<Self> {
        let paths = [path.as_ref()];
        Self::from_safetensors_files(config, &paths, device)
    }

    /// Load the model from one or more safetensors shards.
    pub fn from_safetensors_files(
        config: WhaleConfig,
        paths: &[&Path],
        device: &Device,
    ) -> WhaleResult<Self> {
        // F32 on CPU (BF16 matmul is not supported there), BF16 on
        // accelerators.
        let dtype = if device.is_metal() || device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(paths, dtype, device)
                .map_err(WhaleError::Candle)?
        };
        Self::new(config, vb, device, dtype)
    }

    /// Forward pass.
    ///
    /// Exactly one of `input_features` (raw acoustic features,
    /// `(batch, time, input_dim)`) and `input_embeds` (precomputed
    /// embeddings, `(batch, time', hidden)`) must be provided. Raw
    /// features run through subsampling and embedding; precomputed
    /// embeddings go straight to the encoder.
    ///
    /// A missing `attention_mask` (`(batch, 1, time)`, nonzero = valid) is
    /// treated as all frames valid.
    pub fn forward(
        &self,
        input_features: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        output_hidden_states: Option<bool>,
        train: bool,
    ) -> WhaleResult<WhaleAudioOutput> {
        let output_hidden_states =
            output_hidden_states.unwrap_or(self.config.output_hidden_states);

        let (hidden_states, mask, pos_emb) = match (input_features, input_embeds) {
            (None, None) => {
                return Err(WhaleError::Input(
                    "you have to specify either input_features or input_embeds".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(WhaleError::Input(
                    "input_features and input_embeds are mutually exclusive".to_string(),
                ))
            }
            (Some(features), None) => {
                if features.dims().len() != 3 {
                    return Err(WhaleError::Input(format!(
                        "input_features must have shape (batch, time, input_dim), got {:?}",
                        features.dims()
                    )));
                }
                let features = if features.dtype() != self.dtype {
                    features.to_dtype(self.dtype)?
                } else {
                    features.clone()
                };

                let mask = match attention_mask {
                    Some(m) => m.clone(),
                    None => {
                        let (b, t, _f) = features.dims3()?;
                        Tensor::ones((b, 1, t), DType::U8, features.device())?
                    }
                };

                let (features, mask) = self.subsampling.forward(&features, &mask)?;
                let (hidden_states, pos_emb) = self.embeddings.forward(&features, train)?;
                (hidden_states, mask, pos_emb)
            }
            (None, Some(embeds)) => {
                let (b, t, _d) = embeds.dims3()?;
                let mask = match attention_mask {
                    Some(m) => m.clone(),
                    None => Tensor::ones((b, 1, t), DType::U8, embeds.device())?,
                };
                // Precomputed embeddings skip the embedding block, so the
                // positional slice is re-derived from its table.
                let pos_emb = self.embeddings.position_encoding(0, t, train)?;
                (embeds.clone(), mask, pos_emb)
            }
        };

        if whale_core::debug::enabled() {
            eprintln!(
                "DEBUG WhaleAudioModel: hidden={:?}, mask={:?}, pos={:?}",
                hidden_states.dims(),
                mask.dims(),
                pos_emb.dims()
            );
        }

        let (last_hidden_state, hidden_states) = self.encoder.forward(
            &hidden_states,
            Some(&mask),
            Some(&pos_emb),
            output_hidden_states,
            train,
        )?;
        let pooler_output = last_hidden_state.i((.., 0, ..))?;

        Ok(WhaleAudioOutput {
            last_hidden_state,
            pooler_output,
            hidden_states,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &WhaleConfig {
        &self.config
    }

    /// Subsampling factor along the time axis.
    pub fn subsampling_rate(&self) -> usize {
        self.subsampling.subsampling_rate()
    }
}

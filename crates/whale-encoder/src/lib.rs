//! # whale-encoder
//!
//! Whale speech encoder.
//!
//! The encoder turns acoustic feature frames (e.g. filterbank features of
//! shape `[batch, time, input_dim]`) into hidden states consumable by a
//! multimodal language model:
//!
//! 1. Conv2D subsampling (4x temporal compression via 2x stride-2 convs)
//! 2. Linear embedding with relative sinusoidal positional encoding
//! 3. N transformer encoder layers with Transformer-XL style
//!    relative-position self-attention
//! 4. Optional final layer normalization (pre-norm configurations)
//!
//! Weights load from safetensors through `candle_nn::VarBuilder` with
//! tensor names matching the reference checkpoint.

pub mod config;
pub mod embeddings;
pub mod layers;
pub mod model;
pub mod position;
pub mod subsampling;

pub use config::WhaleConfig;
pub use model::{Encoder, WhaleAudioModel, WhaleAudioOutput};

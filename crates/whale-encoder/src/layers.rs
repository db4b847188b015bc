//! Neural network layers for the Whale encoder.
//!
//! - LayerNorm with learnable weight and bias, computed in f32
//! - Multi-head self-attention with optional Transformer-XL style
//!   relative positional bias and optional Q/K normalization
//! - Feed-forward network with a configurable activation
//! - Encoder layer with pre/post-norm and concat-after residual modes

use candle_core::{bail, DType, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{linear, linear_no_bias, Activation, Dropout, Linear, Module, VarBuilder};
use tracing::warn;

use crate::config::WhaleConfig;

/// LayerNorm layer with learnable weight and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((hidden_size,), "weight")?;
        let bias = vb.get((hidden_size,), "bias")?;
        Ok(Self { weight, bias, eps })
    }

    /// Apply LayerNorm to the input tensor.
    ///
    /// Statistics are computed in f32 for stability and cast back to the
    /// input dtype.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let x_centered = x_f32.broadcast_sub(&mean)?;
        let variance = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;

        let w = if self.weight.dtype() != input_dtype {
            self.weight.to_dtype(input_dtype)?
        } else {
            self.weight.clone()
        };
        let b = if self.bias.dtype() != input_dtype {
            self.bias.to_dtype(input_dtype)?
        } else {
            self.bias.clone()
        };
        x_normed.broadcast_mul(&w)?.broadcast_add(&b)
    }
}

/// Multi-head self-attention.
///
/// Two execution paths chosen at construction time:
///
/// - the standard path with separate Q/K/V projections, optionally
///   augmented with relative positional bias terms `pos_bias_u` and
///   `pos_bias_v` (content-content and content-position scores as in
///   Transformer-XL, Appendix B of <https://arxiv.org/abs/1901.02860>);
/// - a fused path delegating score/softmax/weighted-sum to
///   `candle_flash_attn` when the `flash-attn` feature is compiled in.
///
/// Masked positions are set to `-inf` before softmax. A row whose
/// positions are all masked therefore softmaxes to NaN; callers are
/// expected to keep at least one valid frame per row.
#[derive(Debug, Clone)]
pub struct Attention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_out: Linear,
    /// Projection of the positional tensor, relative-PE path only.
    linear_pos: Option<Linear>,
    /// Learnable content bias `u`, shape `(num_heads, head_dim)`.
    pos_bias_u: Option<Tensor>,
    /// Learnable position bias `v`, shape `(num_heads, head_dim)`.
    pos_bias_v: Option<Tensor>,
    q_norm: Option<LayerNorm>,
    k_norm: Option<LayerNorm>,
    attn_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    embed_dim: usize,
    scale: f64,
    use_flash_attn: bool,
}

impl Attention {
    pub fn new(config: &WhaleConfig, vb: VarBuilder) -> Result<Self> {
        let embed_dim = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let head_dim = embed_dim / num_heads;
        if head_dim * num_heads != embed_dim {
            bail!(
                "embed_dim must be divisible by num_heads (got embed_dim: {embed_dim} and num_heads: {num_heads})"
            );
        }

        let mut use_flash_attn = config.use_flash_attn;
        if use_flash_attn && !cfg!(feature = "flash-attn") {
            warn!("flash attention requested but the flash-attn feature is not compiled in; using the standard attention path");
            use_flash_attn = false;
        }
        if use_flash_attn && config.use_relative_pe {
            warn!("flash attention does not support relative positional bias; using the standard attention path");
            use_flash_attn = false;
        }

        let linear_q = linear(embed_dim, embed_dim, vb.pp("linear_q"))?;
        let linear_k = linear(embed_dim, embed_dim, vb.pp("linear_k"))?;
        let linear_v = linear(embed_dim, embed_dim, vb.pp("linear_v"))?;
        let linear_out = linear(embed_dim, embed_dim, vb.pp("linear_out"))?;

        let (q_norm, k_norm) = if config.qk_normalization {
            (
                Some(LayerNorm::new(
                    embed_dim,
                    config.layer_norm_eps,
                    vb.pp("q_norm"),
                )?),
                Some(LayerNorm::new(
                    embed_dim,
                    config.layer_norm_eps,
                    vb.pp("k_norm"),
                )?),
            )
        } else {
            (None, None)
        };

        let (linear_pos, pos_bias_u, pos_bias_v) = if config.use_relative_pe {
            (
                Some(linear_no_bias(embed_dim, embed_dim, vb.pp("linear_pos"))?),
                Some(vb.get((num_heads, head_dim), "pos_bias_u")?),
                Some(vb.get((num_heads, head_dim), "pos_bias_v")?),
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            linear_q,
            linear_k,
            linear_v,
            linear_out,
            linear_pos,
            pos_bias_u,
            pos_bias_v,
            q_norm,
            k_norm,
            attn_drop: Dropout::new(config.attention_dropout),
            num_heads,
            head_dim,
            embed_dim,
            scale: (head_dim as f64).powf(-0.5),
            use_flash_attn,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `hidden_states` - `(batch, time, embed_dim)`
    /// * `attention_mask` - `(batch, 1, time)`, nonzero = valid frame
    /// * `pos_emb` - positional tensor `(1, time, embed_dim)`; required
    ///   when relative PE is enabled
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        if self.use_flash_attn {
            #[cfg(feature = "flash-attn")]
            return self.fused_attn(hidden_states, train);
        }
        self.naive_attn(hidden_states, attention_mask, pos_emb, train)
    }

    fn naive_attn(
        &self,
        x: &Tensor,
        attention_mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, t, _c) = x.dims3()?;

        let mut q = self.linear_q.forward(x)?;
        let mut k = self.linear_k.forward(x)?;
        let v = self.linear_v.forward(x)?;

        // Q/K normalization over the full embedding dimension, before the
        // head split (equivalent to the flatten/view dance on split heads).
        if let (Some(q_norm), Some(k_norm)) = (&self.q_norm, &self.k_norm) {
            q = q_norm.forward(&q)?;
            k = k_norm.forward(&k)?;
        }

        // (batch, heads, time, head_dim)
        let q = q
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scores = if let (Some(linear_pos), Some(bias_u), Some(bias_v)) =
            (&self.linear_pos, &self.pos_bias_u, &self.pos_bias_v)
        {
            let pos_emb = match pos_emb {
                Some(p) => p,
                None => bail!("relative positional attention requires pos_emb"),
            };
            let pos_len = pos_emb.dim(1)?;
            let p = linear_pos
                .forward(&pos_emb.to_dtype(q.dtype())?)?
                .reshape(((), pos_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?; // (1, heads, time, head_dim)

            let bias_u = bias_u.reshape((1, self.num_heads, 1, self.head_dim))?;
            let bias_v = bias_v.reshape((1, self.num_heads, 1, self.head_dim))?;
            let q_with_bias_u = q.broadcast_add(&bias_u)?;
            let q_with_bias_v = q.broadcast_add(&bias_v)?;

            // Content-content (matrix a+c) and content-position (matrix
            // b+d) terms of the Transformer-XL decomposition.
            let matrix_ac = q_with_bias_u.matmul(&k.transpose(2, 3)?)?;
            let matrix_bd = q_with_bias_v.broadcast_matmul(&p.transpose(2, 3)?)?;
            ((matrix_ac + matrix_bd)? * self.scale)?
        } else {
            ((q * self.scale)?.matmul(&k.transpose(2, 3)?))?
        };

        let scores = match attention_mask {
            Some(mask) => {
                let mask = if mask.dtype() == DType::U8 {
                    mask.clone()
                } else {
                    mask.to_dtype(DType::U8)?
                };
                // (batch, 1, time) -> (batch, 1, 1, time), broadcast over
                // heads and query positions.
                let mask = mask.unsqueeze(1)?.broadcast_as(scores.shape())?;
                let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
                    .to_dtype(scores.dtype())?
                    .broadcast_as(scores.shape())?;
                mask.where_cond(&scores, &neg_inf)?
            }
            None => scores,
        };

        // Softmax in f32 for stability.
        let attn = softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(scores.dtype())?;
        let attn = self.attn_drop.forward(&attn, train)?;

        let context = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.embed_dim))?;
        self.linear_out.forward(&context)
    }

    /// Fused path: scores, softmax and weighted sum run inside the flash
    /// attention kernel. Padding masks are not supported here; this path
    /// is meant for unpadded batches.
    #[cfg(feature = "flash-attn")]
    fn fused_attn(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        let (b, t, _c) = x.dims3()?;

        let mut q = self.linear_q.forward(x)?;
        let mut k = self.linear_k.forward(x)?;
        let v = self.linear_v.forward(x)?;
        if let (Some(q_norm), Some(k_norm)) = (&self.q_norm, &self.k_norm) {
            q = q_norm.forward(&q)?;
            k = k_norm.forward(&k)?;
        }

        // flash_attn expects (batch, seq, heads, head_dim).
        let q = q.reshape((b, t, self.num_heads, self.head_dim))?;
        let k = k.reshape((b, t, self.num_heads, self.head_dim))?;
        let v = v.reshape((b, t, self.num_heads, self.head_dim))?;

        let context = candle_flash_attn::flash_attn(&q, &k, &v, self.scale as f32, false)?
            .reshape((b, t, self.embed_dim))?;
        self.linear_out.forward(&context)
    }
}

/// Feed-forward network: w_1 -> activation -> dropout -> w_2.
///
/// Position-wise; no cross-token interaction.
#[derive(Debug, Clone)]
pub struct FeedForward {
    w_1: Linear,
    w_2: Linear,
    act: Activation,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(config: &WhaleConfig, vb: VarBuilder) -> Result<Self> {
        let w_1 = linear(config.hidden_size, config.intermediate_size, vb.pp("w_1"))?;
        let w_2 = linear(config.intermediate_size, config.hidden_size, vb.pp("w_2"))?;
        let act = config
            .activation()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        Ok(Self {
            w_1,
            w_2,
            act,
            dropout: Dropout::new(config.dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.w_1.forward(x)?;
        let h = self.act.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        self.w_2.forward(&h)
    }
}

/// Transformer encoder layer.
///
/// Attention and feed-forward sub-blocks with residual connections.
/// `normalize_before` selects pre-norm (norm before the sub-block,
/// residual added to the un-normalized branch) vs post-norm ordering.
/// With `concat_after`, the attention output is concatenated with its
/// input along the feature axis and projected back down instead of the
/// plain residual addition.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    attn: Attention,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    concat_linear: Option<Linear>,
    dropout: Dropout,
    normalize_before: bool,
}

impl EncoderLayer {
    pub fn new(config: &WhaleConfig, vb: VarBuilder) -> Result<Self> {
        let embed_dim = config.hidden_size;
        let attn = Attention::new(config, vb.pp("attn"))?;
        let feed_forward = FeedForward::new(config, vb.pp("feed_forward"))?;
        let norm1 = LayerNorm::new(embed_dim, config.layer_norm_eps, vb.pp("norm1"))?;
        let norm2 = LayerNorm::new(embed_dim, config.layer_norm_eps, vb.pp("norm2"))?;
        let concat_linear = if config.concat_after {
            Some(linear(embed_dim * 2, embed_dim, vb.pp("concat_linear"))?)
        } else {
            None
        };

        Ok(Self {
            attn,
            feed_forward,
            norm1,
            norm2,
            concat_linear,
            dropout: Dropout::new(config.dropout),
            normalize_before: config.normalize_before,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        // Attention sub-block.
        let residual = hidden_states;
        let h = if self.normalize_before {
            self.norm1.forward(hidden_states)?
        } else {
            hidden_states.clone()
        };
        let attn_out = self.attn.forward(&h, attention_mask, pos_emb, train)?;
        let mut h = match &self.concat_linear {
            Some(concat_linear) => {
                let concat = Tensor::cat(&[&h, &attn_out], D::Minus1)?;
                (concat_linear.forward(&concat)? + residual)?
            }
            None => (self.dropout.forward(&attn_out, train)? + residual)?,
        };
        if !self.normalize_before {
            h = self.norm1.forward(&h)?;
        }

        // Feed-forward sub-block.
        let residual = h.clone();
        let ff_in = if self.normalize_before {
            self.norm2.forward(&h)?
        } else {
            h
        };
        let ff_out = self.feed_forward.forward(&ff_in, train)?;
        let mut h = (self.dropout.forward(&ff_out, train)? + residual)?;
        if !self.normalize_before {
            h = self.norm2.forward(&h)?;
        }
        Ok(h)
    }
}

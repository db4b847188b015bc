//! Integration tests for the full Whale audio model pipeline.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use whale_core::WhaleError;
use whale_encoder::{WhaleAudioModel, WhaleConfig};

fn tiny_config() -> WhaleConfig {
    WhaleConfig {
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        intermediate_size: 32,
        input_dim: 21,
        max_position_embeddings: 128,
        dropout: 0.0,
        attention_dropout: 0.0,
        ..WhaleConfig::whale_base()
    }
}

fn tiny_model(config: WhaleConfig) -> WhaleAudioModel {
    let device = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &device);
    WhaleAudioModel::new(config, vb, &device, DType::F32).expect("model construction")
}

#[test]
fn test_forward_from_features() {
    let config = tiny_config();
    let model = tiny_model(config.clone());

    let time = 50;
    let features = Tensor::zeros((2, time, config.input_dim), DType::F32, &Device::Cpu).unwrap();
    let output = model
        .forward(Some(&features), None, None, None, false)
        .unwrap();

    // ((50 - 1) / 2 - 1) / 2 = 11 frames after 4x subsampling.
    assert_eq!(output.last_hidden_state.dims(), &[2, 11, 16]);
    assert_eq!(output.pooler_output.dims(), &[2, 16]);
    assert!(output.hidden_states.is_none());
}

#[test]
fn test_forward_from_embeds() {
    let config = tiny_config();
    let model = tiny_model(config);

    let embeds = Tensor::zeros((1, 9, 16), DType::F32, &Device::Cpu).unwrap();
    let output = model
        .forward(None, None, Some(&embeds), None, false)
        .unwrap();

    assert_eq!(output.last_hidden_state.dims(), &[1, 9, 16]);
    assert_eq!(output.pooler_output.dims(), &[1, 16]);
}

#[test]
fn test_rejects_neither_input() {
    let model = tiny_model(tiny_config());
    let err = model.forward(None, None, None, None, false).unwrap_err();
    assert!(matches!(err, WhaleError::Input(_)));
}

#[test]
fn test_rejects_both_inputs() {
    let config = tiny_config();
    let model = tiny_model(config.clone());

    let features = Tensor::zeros((1, 40, config.input_dim), DType::F32, &Device::Cpu).unwrap();
    let embeds = Tensor::zeros((1, 9, 16), DType::F32, &Device::Cpu).unwrap();
    let err = model
        .forward(Some(&features), None, Some(&embeds), None, false)
        .unwrap_err();
    assert!(matches!(err, WhaleError::Input(_)));
}

#[test]
fn test_rejects_wrong_feature_rank() {
    let config = tiny_config();
    let model = tiny_model(config.clone());

    let features = Tensor::zeros((40, config.input_dim), DType::F32, &Device::Cpu).unwrap();
    let err = model
        .forward(Some(&features), None, None, None, false)
        .unwrap_err();
    assert!(matches!(err, WhaleError::Input(msg) if msg.contains("batch, time, input_dim")));
}

#[test]
fn test_hidden_state_capture() {
    let config = tiny_config();
    let model = tiny_model(config.clone());

    let features = Tensor::zeros((1, 50, config.input_dim), DType::F32, &Device::Cpu).unwrap();
    let output = model
        .forward(Some(&features), None, None, Some(true), false)
        .unwrap();

    let states = output.hidden_states.expect("hidden states requested");
    assert_eq!(states.len(), config.num_hidden_layers + 1);
    for state in &states {
        assert_eq!(state.dims(), output.last_hidden_state.dims());
    }
}

#[test]
fn test_explicit_mask_roundtrip() {
    let config = tiny_config();
    let model = tiny_model(config.clone());

    let time = 50;
    let features = Tensor::zeros((1, time, config.input_dim), DType::F32, &Device::Cpu).unwrap();
    let mask = Tensor::ones((1, 1, time), DType::U8, &Device::Cpu).unwrap();
    let output = model
        .forward(Some(&features), Some(&mask), None, None, false)
        .unwrap();
    assert_eq!(output.last_hidden_state.dims(), &[1, 11, 16]);
}

#[test]
fn test_pre_and_post_norm_output_shapes_match() {
    let features = Tensor::zeros((1, 50, 21), DType::F32, &Device::Cpu).unwrap();
    let mut dims = Vec::new();
    for normalize_before in [true, false] {
        let config = WhaleConfig {
            normalize_before,
            ..tiny_config()
        };
        let model = tiny_model(config);
        let output = model
            .forward(Some(&features), None, None, None, false)
            .unwrap();
        dims.push(output.last_hidden_state.dims().to_vec());
    }
    assert_eq!(dims[0], dims[1]);
}

#[test]
fn test_construction_rejects_bad_config() {
    let config = WhaleConfig {
        num_attention_heads: 5, // 16 % 5 != 0
        ..tiny_config()
    };
    let device = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &device);
    let err = WhaleAudioModel::new(config, vb, &device, DType::F32).unwrap_err();
    assert!(matches!(err, WhaleError::Config(_)));
}

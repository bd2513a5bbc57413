//! Integration tests for layerstat-rs
//!
//! All tests run on CPU with small hand-built or seeded networks.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Activation, Linear};
use layerstat::{
    extract_activations, extract_gradients, extract_weights, Batch, BasisLinear, DenseBlock,
    InitMode, Layer, ModelType, Network, ParamKind, PermutationRep, Sweep, SweepConfig,
};
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn var(values: &[f32], shape: &[usize], device: &Device) -> Var {
    let tensor = Tensor::from_vec(values.to_vec(), shape, device).unwrap();
    Var::from_tensor(&tensor).unwrap()
}

/// Basis-decomposed 3→2 layer (4 coefficients) followed by a dense 2→1 head with bias
fn two_layer_model(device: &Device) -> Network {
    let basis_values: Vec<f32> = (0..24).map(|i| ((i % 5) as f32 - 2.0) * 0.25).collect();
    let basis = Tensor::from_vec(basis_values, (2, 3, 4), device).unwrap();
    let coeff = var(&[0.5, -0.3, 0.8, 0.1], &[4], device);
    let head_weight = var(&[0.7, -0.4], &[1, 2], device);
    let head_bias = Tensor::new(&[0.2f32], device).unwrap();

    Network::new(vec![
        Layer::BasisLinear(BasisLinear::new(basis, coeff, None).unwrap()),
        Layer::PlainDense(Linear::new(head_weight.as_tensor().clone(), Some(head_bias))),
    ])
}

fn batch(device: &Device) -> Batch {
    let features = Tensor::new(
        &[[1.0f32, 0.5, -1.0], [0.2, -0.3, 0.9], [-0.7, 1.1, 0.4]],
        device,
    )
    .unwrap();
    let targets = Tensor::new(&[[0.5f32], [-1.0], [0.25]], device).unwrap();
    Batch::new(features, targets).unwrap()
}

fn small_config() -> SweepConfig {
    SweepConfig {
        num_layers: 1,
        num_channels: 4,
        batch_size: 8,
        seed: 3,
        rep_in: PermutationRep::swap_pairs(4),
        rep_out: PermutationRep::swap_pairs(2),
        ..Default::default()
    }
}

/// Weight table of a mixed model holds exactly the weight and coefficient
/// elements, and nothing from the bias
#[test]
fn test_weight_table_counts_exclude_bias() {
    let device = Device::Cpu;
    let table = extract_weights(&two_layer_model(&device))
        .unwrap()
        .to_table()
        .unwrap();

    assert_eq!(table.count(0, ParamKind::W), 6);
    assert_eq!(table.count(1, ParamKind::W), 2);
    assert_eq!(table.count(0, ParamKind::Coeff), 4);
    assert_eq!(table.count(1, ParamKind::Coeff), 0);
    assert_eq!(table.count(0, ParamKind::Basis), 6);
    assert_eq!(table.len(), 6 + 2 + 4 + 6);
    // head bias value never appears among the head's rows
    assert_eq!(table.values_for(1, ParamKind::W), vec![0.7, -0.4]);
}

/// 5 samples through a single 3→4 dense layer give 20 activation rows at layer 0
#[test]
fn test_single_dense_layer_activation_rows() {
    let device = Device::Cpu;
    let weight = var(&[0.1; 12], &[4, 3], &device);
    let net = Network::new(vec![Layer::PlainDense(Linear::new(
        weight.as_tensor().clone(),
        None,
    ))]);
    let features = Tensor::ones((5, 3), DType::F32, &device).unwrap();
    let targets = Tensor::zeros((5, 4), DType::F32, &device).unwrap();
    let batch = Batch::new(features, targets).unwrap();

    let table = extract_activations(&net, &batch).unwrap().to_table();
    assert_eq!(table.len(), 20);
    assert_eq!(table.count(0, ParamKind::Activation), 20);
    assert!(table.rows().iter().all(|r| r.layer == 0));
    assert!(table.rows().iter().all(|r| (r.value - 0.3).abs() < 1e-6));
}

/// Every gradient table lines up with the weight table, layer by layer
#[test]
fn test_gradient_rows_align_with_weight_rows() {
    let device = Device::Cpu;
    let net = two_layer_model(&device);
    let weights = extract_weights(&net).unwrap().to_table().unwrap();
    let grads = extract_gradients(&net, &batch(&device))
        .unwrap()
        .to_table()
        .unwrap();

    for layer in weights.layers() {
        assert_eq!(
            grads.count(layer, ParamKind::Grad),
            weights.count(layer, ParamKind::W),
            "layer {layer}"
        );
        assert_eq!(
            grads.count(layer, ParamKind::CoeffGrad),
            weights.count(layer, ParamKind::Coeff),
            "layer {layer}"
        );
    }
    assert_eq!(grads.non_finite_count(), 0);
}

/// Gradient extraction leaves nothing behind: a second call sees the same values
#[test]
fn test_gradient_extraction_is_repeatable() {
    let device = Device::Cpu;
    let net = two_layer_model(&device);
    let batch = batch(&device);

    let first = extract_gradients(&net, &batch).unwrap();
    assert!(net.is_grad_clean());
    let second = extract_gradients(&net, &batch).unwrap();
    assert_eq!(first.weight_grads, second.weight_grads);
    assert_eq!(first.coeff_grads, second.coeff_grads);
}

/// Activations are recorded before the nonlinearity of each block
#[test]
fn test_block_activations_are_pre_nonlinearity() {
    let device = Device::Cpu;
    let weight = var(&[-1.0, 0.0, 0.0, 0.0, 0.0, 1.0], &[2, 3], &device);
    let net = Network::new(vec![Layer::DenseBlock(DenseBlock::new(
        Linear::new(weight.as_tensor().clone(), None),
        Activation::Relu,
    ))]);

    let snapshot = extract_activations(&net, &batch(&device)).unwrap();
    // first feature negated: 1.0 → -1.0 survives only before the relu
    assert_eq!(snapshot.pre_activations[&0][0], -1.0);
    assert_eq!(snapshot.pre_activations[&0].len(), 6);
}

/// Sweep config loading from JSON, missing fields take defaults
#[test]
fn test_config_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "model_types": ["emlp"],
        "init_modes": ["fan_in", "arithmetic_mean"],
        "num_layers": 2,
        "batch_size": 16
    }}"#
    )
    .unwrap();

    let config = SweepConfig::load(file.path()).unwrap();
    assert_eq!(config.model_types, vec![ModelType::Emlp]);
    assert_eq!(
        config.init_modes,
        vec![InitMode::FanIn, InitMode::ArithmeticMean]
    );
    assert_eq!(config.num_layers, 2);
    assert_eq!(config.batch_size, 16);
    assert_eq!(config.num_channels, 64);
    assert_eq!(config.seed, 10);
}

/// Invalid configs are refused at load time
#[test]
fn test_config_rejects_zero_batch() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"batch_size": 0}}"#).unwrap();
    assert!(SweepConfig::load(file.path()).is_err());
}

/// Same seed, same grand tables
#[test]
fn test_sweep_is_deterministic() {
    let device = Device::Cpu;
    let a = Sweep::from_config(small_config(), &device)
        .unwrap()
        .run()
        .unwrap();
    let b = Sweep::from_config(small_config(), &device)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(a.combinations, b.combinations);
    assert_eq!(a.weights.rows(), b.weights.rows());
    assert_eq!(a.gradients.rows(), b.gradients.rows());
    assert_eq!(a.activations.rows(), b.activations.rows());
}

/// Grand tables carry every combination and only the kinds of their family
#[test]
fn test_sweep_grand_tables() {
    let results = Sweep::from_config(small_config(), &Device::Cpu)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(results.combinations.len(), 9);

    let mlp = results.weights.for_model_type("mlp");
    assert!(mlp.rows().iter().all(|r| r.param == ParamKind::W));
    let emlp = results.weights.for_model_type("emlp");
    assert!(emlp.rows().iter().any(|r| r.param == ParamKind::Coeff));
    assert!(emlp.rows().iter().any(|r| r.param == ParamKind::Basis));

    assert!(results
        .gradients
        .rows()
        .iter()
        .all(|r| matches!(r.param, ParamKind::Grad | ParamKind::CoeffGrad)));
    assert!(results
        .activations
        .rows()
        .iter()
        .all(|r| r.model_type.is_some() && r.init_mode.is_some()));
}

/// Tables serialize as JSON records keyed by column name
#[test]
fn test_write_json_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("weights.json");
    let table = extract_weights(&two_layer_model(&Device::Cpu))
        .unwrap()
        .to_table()
        .unwrap()
        .with_facets("emlp", "fan_in");
    table.write_json(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = serde_json::from_str(&content).unwrap();
    assert_eq!(records.len(), table.len());
    assert_eq!(records[0]["Layer"], 0);
    assert_eq!(records[0]["Param"], "W");
    assert_eq!(records[0]["Model Type"], "emlp");
    assert!(records[0]["Param_Value"].is_number());
}

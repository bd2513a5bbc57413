//! One instrumented forward/backward pass capturing per-layer gradients

use anyhow::{Context, Result};
use tracing::debug;

use crate::data::Batch;
use crate::layers::{classify, flatten_values};
use crate::network::{GradRetention, Network};
use crate::table::{LongTable, ParamKind, StatFamily};
use crate::weights::LayerValues;

#[derive(Debug, Clone, Default)]
pub struct GradientSnapshot {
    /// Gradient of every weight-bearing layer's weight, shaped like the weight
    pub weight_grads: LayerValues,
    /// Gradient of the basis coefficients of basis-decomposed layers
    pub coeff_grads: LayerValues,
}

impl GradientSnapshot {
    /// Long table tagged `Grad` and `c-grad`
    pub fn to_table(&self) -> Result<LongTable> {
        LongTable::union(
            StatFamily::Gradients,
            [
                LongTable::from_layers(&self.weight_grads, ParamKind::Grad),
                LongTable::from_layers(&self.coeff_grads, ParamKind::CoeffGrad),
            ],
        )
    }
}

/// Run one batch through the network, backpropagate the MSE loss once and
/// snapshot the gradients of the same tensors [`crate::extract_weights`] reports.
///
/// The network is left without gradient bookkeeping on return, whether the
/// extraction succeeds or not, so calling this twice on the same network and
/// batch yields identical snapshots.
pub fn extract_gradients(network: &Network, batch: &Batch) -> Result<GradientSnapshot> {
    network.zero_grad();

    let snapshot = {
        let retention = GradRetention::open(network)?;
        let preds = network.forward(&batch.features)?;
        let loss = candle_nn::loss::mse(&preds, &batch.targets)
            .context("Failed to compute MSE between predictions and targets")?;
        debug!(loss = loss.to_scalar::<f32>().ok(), "backward");
        let grads = loss.backward()?;

        let mut snapshot = GradientSnapshot::default();
        for (index, layer) in network.layers().iter().enumerate() {
            if layer.is_parameter_free() {
                continue;
            }
            let kind = classify(layer)?;

            if kind.is_basis_decomposed() {
                let weight_grad = retention.weight_grad(index, &grads)?;
                let coeff_grad = retention.coeff_grad(index, &weight_grad)?;
                snapshot
                    .weight_grads
                    .insert(index, flatten_values(&weight_grad)?);
                snapshot
                    .coeff_grads
                    .insert(index, flatten_values(&coeff_grad)?);
            } else {
                let weight = kind.weight()?;
                let grad = grads
                    .get(&weight)
                    .with_context(|| format!("No gradient reached the weight of layer {index}"))?;
                snapshot.weight_grads.insert(index, flatten_values(grad)?);
            }
        }
        snapshot
    };

    network.zero_grad();
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BasisLinear, DenseBlock, Layer};
    use crate::weights::extract_weights;
    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::{Activation, Linear};

    fn var(t: Tensor) -> Var {
        Var::from_tensor(&t).unwrap()
    }

    #[test]
    fn test_dense_gradient_matches_closed_form() {
        let device = Device::Cpu;
        // y = x W^T with W = [[1, 2]], loss = mean((y - t)^2)
        let weight = var(Tensor::new(&[[1.0f32, 2.0]], &device).unwrap());
        let net = Network::new(vec![Layer::PlainDense(Linear::new(
            weight.as_tensor().clone(),
            None,
        ))]);
        let x = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &device).unwrap();
        let t = Tensor::new(&[[0.0f32], [0.0]], &device).unwrap();
        let batch = Batch::new(x, t).unwrap();

        let snapshot = extract_gradients(&net, &batch).unwrap();
        // residuals r = [1, 2]; dL/dW = (2 / n) * r^T x = [1, 2]
        let grad = &snapshot.weight_grads[&0];
        assert!((grad[0] - 1.0).abs() < 1e-6);
        assert!((grad[1] - 2.0).abs() < 1e-6);
        assert!(snapshot.coeff_grads.is_empty());
    }

    #[test]
    fn test_basis_layer_with_identity_basis_matches_dense() {
        let device = Device::Cpu;
        let w = Tensor::new(&[[0.3f32, 0.7, 0.2], [0.5, -0.1, 0.4]], &device).unwrap();
        // identity basis: one coefficient per weight cell
        let eye: Vec<f32> = (0..36).map(|i| if i % 7 == 0 { 1.0 } else { 0.0 }).collect();
        let basis = Tensor::from_vec(eye, (2, 3, 6), &device).unwrap();
        let coeff = var(w.flatten_all().unwrap());

        let dense = Network::new(vec![Layer::DenseBlock(DenseBlock::new(
            Linear::new(var(w.clone()).as_tensor().clone(), None),
            Activation::Relu,
        ))]);
        let equivariant = Network::new(vec![Layer::EquivariantBlock(
            crate::layers::EquivariantBlock::new(
                BasisLinear::new(basis, coeff, None).unwrap(),
                Activation::Relu,
            ),
        )]);

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0], [-1.0, 0.5, 2.0]], &device).unwrap();
        let t = Tensor::new(&[[0.1f32, 0.2], [0.3, -0.1]], &device).unwrap();
        let batch = Batch::new(x, t).unwrap();

        let a = extract_gradients(&dense, &batch).unwrap();
        let b = extract_gradients(&equivariant, &batch).unwrap();
        let ga = &a.weight_grads[&0];
        let gb = &b.weight_grads[&0];
        let gc = &b.coeff_grads[&0];
        assert_eq!(ga.len(), 6);
        for i in 0..6 {
            assert!((ga[i] - gb[i]).abs() < 1e-5);
            assert!((gb[i] - gc[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gradient_shapes_follow_weights() {
        let device = Device::Cpu;
        let basis = Tensor::ones((3, 2, 4), DType::F32, &device).unwrap();
        let coeff = var(Tensor::new(&[0.1f32, 0.2, -0.1, 0.3], &device).unwrap());
        let head = var(Tensor::new(&[[1.0f32, -1.0, 0.5]], &device).unwrap());
        let net = Network::new(vec![
            Layer::BasisLinear(BasisLinear::new(basis, coeff, None).unwrap()),
            Layer::PlainDense(Linear::new(
                head.as_tensor().clone(),
                Some(Tensor::zeros(1, DType::F32, &device).unwrap()),
            )),
        ]);
        let batch = Batch::new(
            Tensor::ones((5, 2), DType::F32, &device).unwrap(),
            Tensor::zeros((5, 1), DType::F32, &device).unwrap(),
        )
        .unwrap();

        let weights = extract_weights(&net).unwrap();
        let grads = extract_gradients(&net, &batch).unwrap();
        for (layer, values) in &weights.weights {
            assert_eq!(grads.weight_grads[layer].len(), values.len());
        }
        for (layer, values) in &weights.basis_coeffs {
            assert_eq!(grads.coeff_grads[layer].len(), values.len());
        }
        assert!(net.is_grad_clean());
    }

    #[test]
    fn test_network_is_clean_after_failure() {
        let device = Device::Cpu;
        let basis = Tensor::ones((2, 2, 1), DType::F32, &device).unwrap();
        let coeff = var(Tensor::ones(1, DType::F32, &device).unwrap());
        let net = Network::new(vec![Layer::BasisLinear(
            BasisLinear::new(basis, coeff, None).unwrap(),
        )]);
        // targets with the wrong width make the loss fail after the scope is open
        let batch = Batch::new(
            Tensor::ones((3, 2), DType::F32, &device).unwrap(),
            Tensor::ones((3, 5), DType::F32, &device).unwrap(),
        )
        .unwrap();
        assert!(extract_gradients(&net, &batch).is_err());
        assert!(net.is_grad_clean());
    }

    #[test]
    fn test_opaque_layer_fails_with_unsupported_type() {
        let device = Device::Cpu;
        let weight = var(Tensor::ones((2, 3), DType::F32, &device).unwrap());
        let net = Network::new(vec![
            Layer::PlainDense(Linear::new(weight.as_tensor().clone(), None)),
            Layer::opaque("Dropout", Activation::Relu),
        ]);
        let batch = Batch::new(
            Tensor::ones((4, 3), DType::F32, &device).unwrap(),
            Tensor::zeros((4, 2), DType::F32, &device).unwrap(),
        )
        .unwrap();

        let err = extract_gradients(&net, &batch).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::InspectError>(),
            Some(crate::error::InspectError::UnsupportedLayerType(t)) if t == "Dropout"
        ));
        assert!(net.is_grad_clean());
    }

    #[test]
    fn test_single_feature_batch() {
        let device = Device::Cpu;
        // W = [[1], [2]], x = 1..=5 as one column, targets zero:
        // dL/dW_j = 2/10 * W_j * sum(x^2) = 11 * W_j
        let weight = var(Tensor::new(&[[1.0f32], [2.0]], &device).unwrap());
        let net = Network::new(vec![Layer::PlainDense(Linear::new(
            weight.as_tensor().clone(),
            None,
        ))]);
        let batch = Batch::new(
            Tensor::new(&[1.0f32, 2.0, 3.0, 4.0, 5.0], &device).unwrap(),
            Tensor::zeros((5, 2), DType::F32, &device).unwrap(),
        )
        .unwrap();

        let snapshot = extract_gradients(&net, &batch).unwrap();
        let grad = &snapshot.weight_grads[&0];
        assert_eq!(grad.len(), 2);
        assert!((grad[0] - 11.0).abs() < 1e-4);
        assert!((grad[1] - 22.0).abs() < 1e-4);
    }
}

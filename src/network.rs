//! Ordered layer sequence and the scoped gradient retention used during backprop

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use crate::error::InspectError;
use crate::layers::{BasisLinear, Layer};

/// View a batch as a `(batch, features)` matrix. Trailing axes are merged and a
/// rank-1 batch becomes a single feature column.
pub fn feature_matrix(xs: &Tensor) -> Result<Tensor> {
    let batch = xs.dim(0)?;
    let width: usize = xs.dims().iter().skip(1).product();
    Ok(xs.reshape((batch, width))?)
}

/// A feed-forward network: layers run in index order, and the index is the
/// join key across every extracted table.
#[derive(Debug)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The network's own composed forward pass over a batch of features
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut hidden = feature_matrix(xs)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        Ok(hidden)
    }

    /// Basis-decomposed layers with their indices
    pub fn basis_layers(&self) -> impl Iterator<Item = (usize, &BasisLinear)> {
        self.layers
            .iter()
            .enumerate()
            .filter_map(|(index, layer)| layer.basis_linear().map(|linear| (index, linear)))
    }

    /// Drop any gradient bookkeeping left on the layers. Idempotent.
    ///
    /// Parameter gradients live in the `GradStore` returned by backprop, so the
    /// only per-layer state to clear is an open retention tap.
    pub fn zero_grad(&self) {
        for (_, linear) in self.basis_layers() {
            linear.close_tap();
        }
    }

    /// True when no layer holds gradient bookkeeping
    pub fn is_grad_clean(&self) -> bool {
        self.basis_layers().all(|(_, linear)| !linear.is_tapped())
    }
}

struct RetainedWeight<'a> {
    index: usize,
    layer: &'a BasisLinear,
    tap: Var,
}

/// Gradient visibility on the derived weights of every basis-decomposed layer,
/// for the duration of one backward pass.
///
/// Candle discards the gradient of every non-variable node while it walks the
/// graph, so a materialized `basis · coeff` weight never keeps one. Opening the
/// scope swaps each derived weight for a leaf tap holding the same values; the
/// forward pass consumes the tap, backprop fills in its gradient, and the
/// coefficient gradient is pulled back through the basis contraction.
///
/// The scope must be opened before the forward pass it instruments. Dropping it
/// removes every tap, on success and on error alike.
pub struct GradRetention<'a> {
    retained: Vec<RetainedWeight<'a>>,
}

impl<'a> GradRetention<'a> {
    pub fn open(network: &'a Network) -> Result<Self> {
        let mut scope = Self {
            retained: Vec::new(),
        };
        for (index, layer) in network.basis_layers() {
            // an error here drops `scope`, which closes the taps opened so far
            let tap = layer.open_tap()?;
            debug!(layer = index, shape = ?tap.as_tensor().dims(), "retaining derived weight");
            scope.retained.push(RetainedWeight { index, layer, tap });
        }
        Ok(scope)
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    fn get(&self, index: usize) -> Result<&RetainedWeight<'a>, InspectError> {
        self.retained
            .iter()
            .find(|r| r.index == index)
            .ok_or(InspectError::GradientRetention { layer: index })
    }

    /// Gradient of the loss with respect to the derived weight at `index`
    pub fn weight_grad(&self, index: usize, grads: &GradStore) -> Result<Tensor> {
        let retained = self.get(index)?;
        let grad = grads
            .get(retained.tap.as_tensor())
            .ok_or(InspectError::GradientRetention { layer: index })?;
        Ok(grad.detach())
    }

    /// Gradient with respect to the basis coefficients, given the weight gradient.
    ///
    /// Backpropagates `sum(weight ⊙ weight_grad)` through `weight = basis · coeff`,
    /// which is the vector-Jacobian product of the contraction.
    pub fn coeff_grad(&self, index: usize, weight_grad: &Tensor) -> Result<Tensor> {
        let retained = self.get(index)?;
        let surrogate = retained
            .layer
            .weight()?
            .mul(&weight_grad.detach())?
            .sum_all()?;
        let grads = surrogate.backward()?;
        let grad = grads
            .get(retained.layer.basis_coeff().as_tensor())
            .ok_or(InspectError::GradientRetention { layer: index })?;
        Ok(grad.detach())
    }
}

impl Drop for GradRetention<'_> {
    fn drop(&mut self) {
        for retained in &self.retained {
            retained.layer.close_tap();
        }
    }
}

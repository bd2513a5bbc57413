//! Read-only snapshot of per-layer weights, basis coefficients and reduced bases

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use crate::layers::{classify, flatten_values};
use crate::network::Network;
use crate::table::{LongTable, ParamKind, StatFamily};

/// Per-layer flattened values, keyed by layer index
pub type LayerValues = BTreeMap<usize, Vec<f32>>;

#[derive(Debug, Clone, Default)]
pub struct WeightSnapshot {
    /// Weight matrix of every weight-bearing layer (materialized for basis layers)
    pub weights: LayerValues,
    /// Basis coefficients of basis-decomposed layers
    pub basis_coeffs: LayerValues,
    /// Basis summed over its last axis, basis-decomposed layers only
    pub reduced_basis: LayerValues,
}

impl WeightSnapshot {
    /// Long table tagged `W`, `c` and `basis`
    pub fn to_table(&self) -> Result<LongTable> {
        LongTable::union(
            StatFamily::Weights,
            [
                LongTable::from_layers(&self.weights, ParamKind::W),
                LongTable::from_layers(&self.basis_coeffs, ParamKind::Coeff),
                LongTable::from_layers(&self.reduced_basis, ParamKind::Basis),
            ],
        )
    }
}

/// Snapshot the weights of every weight-bearing layer.
///
/// Bare nonlinearities are skipped; any other layer the classifier does not
/// recognize fails with `UnsupportedLayerType`. Bias is never read. All values
/// are detached copies, the network is not touched.
pub fn extract_weights(network: &Network) -> Result<WeightSnapshot> {
    let mut snapshot = WeightSnapshot::default();

    for (index, layer) in network.layers().iter().enumerate() {
        if layer.is_parameter_free() {
            continue;
        }
        let kind = classify(layer)?;

        let weight = kind.weight()?;
        debug!(layer = index, kind = kind.name(), shape = ?weight.dims(), "weights");
        snapshot.weights.insert(index, flatten_values(&weight)?);

        if let Some(linear) = kind.basis_linear() {
            snapshot
                .basis_coeffs
                .insert(index, flatten_values(linear.basis_coeff().as_tensor())?);
            snapshot
                .reduced_basis
                .insert(index, flatten_values(&linear.reduced_basis()?)?);
        }
    }

    Ok(snapshot)
}

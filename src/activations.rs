//! Manual layer-by-layer replay recording pre-nonlinearity values
//!
//! The network's own `forward` composes linear map and nonlinearity, so the
//! values a nonlinearity receives are never visible from outside. This replay
//! applies each layer's linear part, records it, then applies the nonlinearity
//! (if any) to produce the next layer's input.

use anyhow::Result;
use candle_core::Module;
use tracing::debug;

use crate::data::Batch;
use crate::layers::{classify, flatten_values};
use crate::network::{feature_matrix, Network};
use crate::table::{LongTable, ParamKind};
use crate::weights::LayerValues;

/// Pre-activation values of every layer, keyed by layer index
#[derive(Debug, Clone, Default)]
pub struct ActivationSnapshot {
    pub pre_activations: LayerValues,
}

impl ActivationSnapshot {
    /// Long table tagged `Activation`
    pub fn to_table(&self) -> LongTable {
        LongTable::from_layers(&self.pre_activations, ParamKind::Activation)
    }
}

/// Replay the network on one batch and record each layer's output before its
/// nonlinearity. Targets are unused.
///
/// Every layer must be one of the four weight-bearing variants; anything else,
/// a bare nonlinearity included, aborts the pass with `UnsupportedLayerType`.
pub fn extract_activations(network: &Network, batch: &Batch) -> Result<ActivationSnapshot> {
    let mut features = feature_matrix(&batch.features.detach())?;
    let mut snapshot = ActivationSnapshot::default();

    for (index, layer) in network.layers().iter().enumerate() {
        let kind = classify(layer)?;
        let pre_activation = kind.detached_linear_forward(&features)?;
        debug!(
            layer = index,
            kind = kind.name(),
            shape = ?pre_activation.dims(),
            "pre-activation"
        );
        snapshot
            .pre_activations
            .insert(index, flatten_values(&pre_activation)?);

        features = match kind.activation() {
            Some(activation) => activation.forward(&pre_activation)?,
            None => pre_activation,
        };
    }

    Ok(snapshot)
}

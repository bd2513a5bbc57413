//! Model and data construction for a sweep
//!
//! Both architectures share the same layout: an input block, `num_layers`
//! hidden blocks and a linear head, `num_layers + 2` layers in total.
//!
//! - `mlp`: `DenseBlock` blocks, `PlainDense` head
//! - `emlp`: `EquivariantBlock` blocks, `BasisLinear` head, bases computed from
//!   the input/output permutation representations

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::Device;
use candle_nn::Linear;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::basis::{equivariant_basis, PermutationRep};
use crate::data::{BatchSource, SyntheticBatches};
use crate::error::InspectError;
use crate::init::{InitMode, Initializer};
use crate::layers::{ActivationKind, BasisLinear, DenseBlock, EquivariantBlock, Layer};
use crate::network::Network;

/// Architecture variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Mlp,
    Emlp,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::Mlp, ModelType::Emlp];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Mlp => "mlp",
            ModelType::Emlp => "emlp",
        }
    }

    pub fn is_basis_decomposed(self) -> bool {
        matches!(self, ModelType::Emlp)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mlp" => Ok(ModelType::Mlp),
            "emlp" => Ok(ModelType::Emlp),
            other => Err(InspectError::InvalidConfig(format!(
                "unknown model type '{other}'"
            ))),
        }
    }
}

/// Builds a fresh network for one (architecture, init mode) combination
pub trait ModelFactory {
    fn build(&self, model_type: ModelType, init_mode: InitMode) -> Result<Network>;
}

/// Builds a fresh batch source for one combination
pub trait DataFactory {
    fn fresh_source(&self) -> Result<Box<dyn BatchSource>>;
}

/// Architecture hyper-parameters shared by both model types
#[derive(Debug, Clone)]
pub struct ArchitectureSpec {
    pub rep_in: PermutationRep,
    pub rep_out: PermutationRep,
    pub num_layers: usize,
    pub num_channels: usize,
    pub activation: ActivationKind,
    pub with_bias: bool,
}

/// Default factory: seeded MLP / EMLP construction
pub struct SweepModelFactory {
    spec: ArchitectureSpec,
    seed: u64,
    device: Device,
}

impl SweepModelFactory {
    pub fn new(spec: ArchitectureSpec, seed: u64, device: Device) -> Result<Self> {
        if spec.num_channels == 0 {
            return Err(InspectError::InvalidConfig("num_channels must be positive".into()).into());
        }
        spec.rep_in.validate()?;
        spec.rep_out.validate()?;
        Ok(Self { spec, seed, device })
    }

    /// Input and output widths of every layer, in order
    fn widths(&self) -> Vec<(usize, usize)> {
        let ch = self.spec.num_channels;
        let mut widths = vec![(self.spec.rep_in.dim(), ch)];
        widths.extend(std::iter::repeat((ch, ch)).take(self.spec.num_layers));
        widths.push((ch, self.spec.rep_out.dim()));
        widths
    }

    fn build_mlp(&self, init_mode: InitMode, init: &mut Initializer) -> Result<Network> {
        let widths = self.widths();
        let last = widths.len() - 1;
        let mut layers = Vec::with_capacity(widths.len());
        for (index, &(fan_in, fan_out)) in widths.iter().enumerate() {
            let std_dev = init_mode.std_dev(fan_in, fan_out);
            let weight = init.var((fan_out, fan_in), std_dev, &self.device)?;
            let bias = if self.spec.with_bias {
                Some(init.var(fan_out, std_dev, &self.device)?.as_tensor().clone())
            } else {
                None
            };
            let linear = Linear::new(weight.as_tensor().clone(), bias);
            debug!(layer = index, fan_in, fan_out, std_dev, "dense layer");
            layers.push(if index == last {
                Layer::PlainDense(linear)
            } else {
                Layer::DenseBlock(DenseBlock::new(linear, self.spec.activation.to_activation()))
            });
        }
        Ok(Network::new(layers))
    }

    fn build_emlp(&self, init_mode: InitMode, init: &mut Initializer) -> Result<Network> {
        let n_generators = self.spec.rep_in.generators().len();
        let hidden = PermutationRep::swap_pairs_with_generators(self.spec.num_channels, n_generators);
        let n_layers = self.spec.num_layers + 2;
        let mut layers = Vec::with_capacity(n_layers);
        for index in 0..n_layers {
            let rep_in = if index == 0 { &self.spec.rep_in } else { &hidden };
            let rep_out = if index == n_layers - 1 {
                &self.spec.rep_out
            } else {
                &hidden
            };
            let basis = equivariant_basis(rep_in, rep_out, &self.device)?;
            let n_basis = basis.dims3()?.2;
            let std_dev = init_mode.std_dev(rep_in.dim(), rep_out.dim());
            let coeff = init.var(n_basis, std_dev, &self.device)?;
            let bias = if self.spec.with_bias {
                Some(init.var(rep_out.dim(), std_dev, &self.device)?)
            } else {
                None
            };
            debug!(layer = index, n_basis, std_dev, "basis layer");
            let linear = BasisLinear::new(basis, coeff, bias)?;
            layers.push(if index == n_layers - 1 {
                Layer::BasisLinear(linear)
            } else {
                Layer::EquivariantBlock(EquivariantBlock::new(
                    linear,
                    self.spec.activation.to_activation(),
                ))
            });
        }
        Ok(Network::new(layers))
    }
}

impl ModelFactory for SweepModelFactory {
    fn build(&self, model_type: ModelType, init_mode: InitMode) -> Result<Network> {
        if init_mode.requires_basis() && !model_type.is_basis_decomposed() {
            return Err(InspectError::InvalidConfig(format!(
                "init mode {init_mode} is only defined for basis-decomposed models, not {model_type}"
            ))
            .into());
        }
        let mut init = Initializer::new(self.seed);
        match model_type {
            ModelType::Mlp => self.build_mlp(init_mode, &mut init),
            ModelType::Emlp => self.build_emlp(init_mode, &mut init),
        }
    }
}

/// Default data factory: a fresh [`SyntheticBatches`] per combination, same seed each time.
///
/// Batches are drawn from `seed + 1`, so features never replay the normal
/// stream [`SweepModelFactory`] samples weights from under the same `seed`.
pub struct SyntheticData {
    pub rep_in: PermutationRep,
    pub rep_out: PermutationRep,
    pub batch_size: usize,
    pub seed: u64,
    pub device: Device,
}

impl DataFactory for SyntheticData {
    fn fresh_source(&self) -> Result<Box<dyn BatchSource>> {
        Ok(Box::new(SyntheticBatches::new(
            &self.rep_in,
            &self.rep_out,
            self.batch_size,
            self.seed.wrapping_add(1),
            &self.device,
        )?))
    }
}

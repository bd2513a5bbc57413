//! Layer variants and the classifier every extractor dispatches through
//!
//! A network is a sequence of [`Layer`]s. Only four of them carry a weight the
//! extractors know how to read:
//!
//! - `PlainDense`: a dense linear map, optional bias
//! - `DenseBlock`: a dense linear map followed by a nonlinearity
//! - `EquivariantBlock`: a [`BasisLinear`] followed by a nonlinearity
//! - `BasisLinear`: `weight = basis · basis_coeff`, no nonlinearity
//!
//! [`classify`] is the single place that decides which of the four a layer is.

use std::cell::RefCell;
use std::fmt;

use anyhow::Result;
use candle_core::{DType, Module, Tensor, Var, D};
use candle_nn::{Activation, Linear};
use serde::{Deserialize, Serialize};

use crate::error::InspectError;

/// Nonlinearities a block can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[default]
    Relu,
    Elu,
    Silu,
    Gelu,
    Sigmoid,
}

impl ActivationKind {
    pub fn to_activation(self) -> Activation {
        match self {
            ActivationKind::Relu => Activation::Relu,
            ActivationKind::Elu => Activation::Elu(1.0),
            ActivationKind::Silu => Activation::Silu,
            ActivationKind::Gelu => Activation::Gelu,
            ActivationKind::Sigmoid => Activation::Sigmoid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Elu => "elu",
            ActivationKind::Silu => "silu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Sigmoid => "sigmoid",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivationKind {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(ActivationKind::Relu),
            "elu" => Ok(ActivationKind::Elu),
            "silu" => Ok(ActivationKind::Silu),
            "gelu" => Ok(ActivationKind::Gelu),
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            other => Err(InspectError::InvalidConfig(format!(
                "unknown activation '{other}'"
            ))),
        }
    }
}

/// Linear map whose weight is a fixed basis contracted with learned coefficients.
///
/// `basis` has shape `(out, in, n_basis)` and never changes; `basis_coeff` has
/// shape `(n_basis,)` and is the only learnable tensor besides the bias. The
/// weight `(out, in)` is materialized on every forward pass and is therefore
/// not a leaf of the autograd graph.
pub struct BasisLinear {
    basis: Tensor,
    basis_coeff: Var,
    bias: Option<Var>,
    /// Leaf stand-in for the materialized weight while a retention scope is open
    tap: RefCell<Option<Var>>,
}

impl BasisLinear {
    pub fn new(basis: Tensor, basis_coeff: Var, bias: Option<Var>) -> Result<Self> {
        let (out_features, _, n_basis) = basis.dims3()?;
        let n_coeff = basis_coeff.as_tensor().elem_count();
        anyhow::ensure!(
            n_coeff == n_basis,
            "basis spans {n_basis} directions but {n_coeff} coefficients were given"
        );
        if let Some(bias) = &bias {
            let n_bias = bias.as_tensor().elem_count();
            anyhow::ensure!(
                n_bias == out_features,
                "bias has {n_bias} elements, expected {out_features}"
            );
        }
        Ok(Self {
            basis,
            basis_coeff,
            bias,
            tap: RefCell::new(None),
        })
    }

    pub fn out_features(&self) -> usize {
        self.basis.dims()[0]
    }

    pub fn in_features(&self) -> usize {
        self.basis.dims()[1]
    }

    pub fn n_basis(&self) -> usize {
        self.basis.dims()[2]
    }

    pub fn basis(&self) -> &Tensor {
        &self.basis
    }

    pub fn basis_coeff(&self) -> &Var {
        &self.basis_coeff
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// Materialize the `(out, in)` weight from the basis and current coefficients
    pub fn weight(&self) -> Result<Tensor> {
        let (out_features, in_features, n_basis) = self.basis.dims3()?;
        let coeff = self.basis_coeff.as_tensor().reshape((n_basis, 1))?;
        let weight = self
            .basis
            .reshape((out_features * in_features, n_basis))?
            .matmul(&coeff)?
            .reshape((out_features, in_features))?;
        Ok(weight)
    }

    /// The basis summed over its last axis, shape `(out, in)`
    pub fn reduced_basis(&self) -> Result<Tensor> {
        Ok(self.basis.sum(D::Minus1)?)
    }

    /// Swap the materialized weight for a leaf copy that the next forward consumes.
    pub(crate) fn open_tap(&self) -> Result<Var> {
        let tap = Var::from_tensor(&self.weight()?.detach())?;
        *self.tap.borrow_mut() = Some(tap.clone());
        Ok(tap)
    }

    pub(crate) fn close_tap(&self) {
        self.tap.borrow_mut().take();
    }

    pub fn is_tapped(&self) -> bool {
        self.tap.borrow().is_some()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let weight = match self.tap.borrow().as_ref() {
            Some(tap) => tap.as_tensor().clone(),
            None => self.weight()?,
        };
        let ys = xs.matmul(&weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(ys.broadcast_add(bias.as_tensor())?),
            None => Ok(ys),
        }
    }
}

impl fmt::Debug for BasisLinear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasisLinear")
            .field("in_features", &self.in_features())
            .field("out_features", &self.out_features())
            .field("n_basis", &self.n_basis())
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

/// Dense linear map followed by a nonlinearity
#[derive(Debug, Clone)]
pub struct DenseBlock {
    pub linear: Linear,
    pub activation: Activation,
}

impl DenseBlock {
    pub fn new(linear: Linear, activation: Activation) -> Self {
        Self { linear, activation }
    }
}

/// Basis-decomposed linear map followed by a nonlinearity
#[derive(Debug)]
pub struct EquivariantBlock {
    pub linear: BasisLinear,
    pub activation: Activation,
}

impl EquivariantBlock {
    pub fn new(linear: BasisLinear, activation: Activation) -> Self {
        Self { linear, activation }
    }
}

/// One entry of a network's layer sequence
pub enum Layer {
    PlainDense(Linear),
    DenseBlock(DenseBlock),
    EquivariantBlock(EquivariantBlock),
    BasisLinear(BasisLinear),
    /// A nonlinearity standing alone; carries no learnable weight
    Nonlinearity(Activation),
    /// Any module the extractors have no structural knowledge of
    Opaque {
        type_name: String,
        module: Box<dyn Module>,
    },
}

impl Layer {
    pub fn opaque(type_name: impl Into<String>, module: impl Module + 'static) -> Self {
        Layer::Opaque {
            type_name: type_name.into(),
            module: Box::new(module),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Layer::PlainDense(_) => "PlainDense",
            Layer::DenseBlock(_) => "DenseBlock",
            Layer::EquivariantBlock(_) => "EquivariantBlock",
            Layer::BasisLinear(_) => "BasisLinear",
            Layer::Nonlinearity(_) => "Nonlinearity",
            Layer::Opaque { type_name, .. } => type_name.as_str(),
        }
    }

    pub fn has_weight(&self) -> bool {
        classify(self).is_ok()
    }

    /// True for layers that are known to hold no learnable tensor at all
    pub fn is_parameter_free(&self) -> bool {
        matches!(self, Layer::Nonlinearity(_))
    }

    pub fn has_bias(&self) -> bool {
        self.bias().is_some()
    }

    pub fn has_basis(&self) -> bool {
        self.basis_linear().is_some()
    }

    pub fn has_activation(&self) -> bool {
        self.activation().is_some()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        match self {
            Layer::PlainDense(linear) => linear.bias(),
            Layer::DenseBlock(block) => block.linear.bias(),
            Layer::EquivariantBlock(block) => block.linear.bias().map(Var::as_tensor),
            Layer::BasisLinear(linear) => linear.bias().map(Var::as_tensor),
            Layer::Nonlinearity(_) | Layer::Opaque { .. } => None,
        }
    }

    pub fn basis_linear(&self) -> Option<&BasisLinear> {
        match self {
            Layer::EquivariantBlock(block) => Some(&block.linear),
            Layer::BasisLinear(linear) => Some(linear),
            _ => None,
        }
    }

    pub fn basis_coeff(&self) -> Option<&Var> {
        self.basis_linear().map(BasisLinear::basis_coeff)
    }

    pub fn basis(&self) -> Option<&Tensor> {
        self.basis_linear().map(BasisLinear::basis)
    }

    pub fn activation(&self) -> Option<Activation> {
        match self {
            Layer::DenseBlock(block) => Some(block.activation),
            Layer::EquivariantBlock(block) => Some(block.activation),
            Layer::Nonlinearity(activation) => Some(*activation),
            _ => None,
        }
    }

    /// The layer's own composed forward pass
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Layer::PlainDense(linear) => Ok(linear.forward(xs)?),
            Layer::DenseBlock(block) => {
                let ys = block.linear.forward(xs)?;
                Ok(block.activation.forward(&ys)?)
            }
            Layer::EquivariantBlock(block) => {
                let ys = block.linear.forward(xs)?;
                Ok(block.activation.forward(&ys)?)
            }
            Layer::BasisLinear(linear) => linear.forward(xs),
            Layer::Nonlinearity(activation) => Ok(activation.forward(xs)?),
            Layer::Opaque { module, .. } => Ok(module.forward(xs)?),
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::PlainDense(linear) => f
                .debug_struct("PlainDense")
                .field("weight", &linear.weight().dims())
                .field("bias", &linear.bias().is_some())
                .finish(),
            Layer::DenseBlock(block) => f
                .debug_struct("DenseBlock")
                .field("weight", &block.linear.weight().dims())
                .field("activation", &block.activation)
                .finish(),
            Layer::EquivariantBlock(block) => f
                .debug_struct("EquivariantBlock")
                .field("linear", &block.linear)
                .field("activation", &block.activation)
                .finish(),
            Layer::BasisLinear(linear) => fmt::Debug::fmt(linear, f),
            Layer::Nonlinearity(activation) => {
                f.debug_tuple("Nonlinearity").field(activation).finish()
            }
            Layer::Opaque { type_name, .. } => f.debug_tuple("Opaque").field(type_name).finish(),
        }
    }
}

/// A weight-bearing layer, resolved once by [`classify`]
#[derive(Debug, Clone, Copy)]
pub enum LayerKind<'a> {
    PlainDense(&'a Linear),
    DenseBlock(&'a DenseBlock),
    EquivariantBlock(&'a EquivariantBlock),
    BasisLinear(&'a BasisLinear),
}

impl<'a> LayerKind<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::PlainDense(_) => "PlainDense",
            LayerKind::DenseBlock(_) => "DenseBlock",
            LayerKind::EquivariantBlock(_) => "EquivariantBlock",
            LayerKind::BasisLinear(_) => "BasisLinear",
        }
    }

    pub fn is_basis_decomposed(&self) -> bool {
        self.basis_linear().is_some()
    }

    /// The dense weight parameter, for the two variants that hold one directly
    pub fn dense_weight(&self) -> Option<&'a Tensor> {
        match *self {
            LayerKind::PlainDense(linear) => Some(linear.weight()),
            LayerKind::DenseBlock(block) => Some(block.linear.weight()),
            _ => None,
        }
    }

    pub fn basis_linear(&self) -> Option<&'a BasisLinear> {
        match *self {
            LayerKind::EquivariantBlock(block) => Some(&block.linear),
            LayerKind::BasisLinear(linear) => Some(linear),
            _ => None,
        }
    }

    pub fn activation(&self) -> Option<Activation> {
        match *self {
            LayerKind::DenseBlock(block) => Some(block.activation),
            LayerKind::EquivariantBlock(block) => Some(block.activation),
            _ => None,
        }
    }

    /// Weight values, materialized for basis-decomposed layers
    pub fn weight(&self) -> Result<Tensor> {
        match *self {
            LayerKind::PlainDense(linear) => Ok(linear.weight().clone()),
            LayerKind::DenseBlock(block) => Ok(block.linear.weight().clone()),
            LayerKind::EquivariantBlock(block) => block.linear.weight(),
            LayerKind::BasisLinear(linear) => linear.weight(),
        }
    }

    pub fn bias(&self) -> Option<&'a Tensor> {
        match *self {
            LayerKind::PlainDense(linear) => linear.bias(),
            LayerKind::DenseBlock(block) => block.linear.bias(),
            LayerKind::EquivariantBlock(block) => block.linear.bias().map(Var::as_tensor),
            LayerKind::BasisLinear(linear) => linear.bias().map(Var::as_tensor),
        }
    }

    /// Apply only the linear transform, leaving any nonlinearity out.
    /// Weight and bias are detached first, so no backprop op is recorded.
    pub fn detached_linear_forward(&self, xs: &Tensor) -> Result<Tensor> {
        let weight = self.weight()?.detach();
        let ys = xs.matmul(&weight.t()?)?;
        match self.bias() {
            Some(bias) => Ok(ys.broadcast_add(&bias.detach())?),
            None => Ok(ys),
        }
    }
}

/// Resolve a layer to one of the four weight-bearing variants
pub fn classify(layer: &Layer) -> Result<LayerKind<'_>, InspectError> {
    match layer {
        Layer::PlainDense(linear) => Ok(LayerKind::PlainDense(linear)),
        Layer::DenseBlock(block) => Ok(LayerKind::DenseBlock(block)),
        Layer::EquivariantBlock(block) => Ok(LayerKind::EquivariantBlock(block)),
        Layer::BasisLinear(linear) => Ok(LayerKind::BasisLinear(linear)),
        other => Err(InspectError::UnsupportedLayerType(
            other.type_name().to_string(),
        )),
    }
}

/// Copy a tensor out of the autograd graph as a flat `f32` vector
pub(crate) fn flatten_values(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.detach().flatten_all()?;
    Ok(flat.to_dtype(DType::F32)?.to_vec1()?)
}

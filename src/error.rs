//! Typed failures raised while inspecting a network
//!
//! Everything else travels as `anyhow::Error`; these variants can be recovered
//! from it with `downcast_ref::<InspectError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    /// A layer is none of the four weight-bearing variants the extractors understand
    #[error("unsupported layer type: {0}")]
    UnsupportedLayerType(String),

    /// The derived weight of a basis-decomposed layer had no gradient after backprop
    #[error("gradient of the derived weight at layer {layer} was not retained")]
    GradientRetention { layer: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

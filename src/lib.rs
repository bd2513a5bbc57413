// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→f32 when sampling weights
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `rep_in`/`rep_out`
#![allow(clippy::module_name_repetitions)] // LayerKind in layers.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! layerstat-rs: layer-wise statistics of plain and basis-decomposed MLPs
//!
//! Harvests weights, weight gradients and pre-activation values from networks
//! made of dense and basis-decomposed (equivariant) layers, and reshapes them
//! into long-format tables for comparison across architectures and
//! initialization modes.
//!
//! ## Architecture
//!
//! - `layers`: layer variants, capability accessors and `classify`
//! - `network`: layer sequence and the scoped gradient retention for derived weights
//! - `weights`: detached snapshot of W, basis coefficients and reduced basis
//! - `gradients`: one instrumented forward/backward pass on a single batch
//! - `activations`: manual replay recording values before each nonlinearity
//! - `table`: long-format tables, kind tags and family unions
//! - `summary`: per-layer descriptive statistics
//! - `basis`: equivariant bases for permutation representations
//! - `init`: initialization modes
//! - `data`: batch sources
//! - `factory`: MLP / EMLP construction
//! - `sweep`: architecture × init-mode sweep producing the grand tables

pub mod activations;
pub mod basis;
pub mod data;
pub mod error;
pub mod factory;
pub mod gradients;
pub mod init;
pub mod layers;
pub mod network;
pub mod summary;
pub mod sweep;
pub mod table;
pub mod weights;

pub use activations::{extract_activations, ActivationSnapshot};
pub use basis::{equivariant_basis, PermutationRep};
pub use data::{Batch, BatchSource, FixedBatch, SyntheticBatches};
pub use error::InspectError;
pub use factory::{
    ArchitectureSpec, DataFactory, ModelFactory, ModelType, SweepModelFactory, SyntheticData,
};
pub use gradients::{extract_gradients, GradientSnapshot};
pub use init::{InitMode, Initializer};
pub use layers::{
    classify, ActivationKind, BasisLinear, DenseBlock, EquivariantBlock, Layer, LayerKind,
};
pub use network::{GradRetention, Network};
pub use summary::{summarize, LayerSummary};
pub use sweep::{Sweep, SweepConfig, SweepResults};
pub use table::{LongTable, ParamKind, Row, StatFamily};
pub use weights::{extract_weights, LayerValues, WeightSnapshot};

//! Sweep runner: architecture × initialization cross-product
//!
//! Builds one model and one batch per valid combination, runs the three
//! extractors and accumulates three grand tables.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::activations::extract_activations;
use crate::basis::PermutationRep;
use crate::error::InspectError;
use crate::factory::{
    ArchitectureSpec, DataFactory, ModelFactory, ModelType, SweepModelFactory, SyntheticData,
};
use crate::gradients::extract_gradients;
use crate::init::InitMode;
use crate::layers::ActivationKind;
use crate::table::{LongTable, StatFamily};
use crate::weights::extract_weights;

/// Configuration for a sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Architecture variants to compare
    pub model_types: Vec<ModelType>,
    /// Initialization modes to compare
    pub init_modes: Vec<InitMode>,
    /// Hidden blocks between the input block and the head
    pub num_layers: usize,
    /// Width of every hidden block
    pub num_channels: usize,
    /// Samples in the single batch each combination is measured on
    pub batch_size: usize,
    /// Seed for model initialization and data generation
    pub seed: u64,
    pub activation: ActivationKind,
    pub with_bias: bool,
    /// Group action on the input features
    pub rep_in: PermutationRep,
    /// Group action on the targets
    pub rep_out: PermutationRep,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            model_types: ModelType::ALL.to_vec(),
            init_modes: InitMode::ALL.to_vec(),
            num_layers: 3,
            num_channels: 64,
            batch_size: 256,
            seed: 10,
            activation: ActivationKind::Relu,
            with_bias: false,
            rep_in: PermutationRep::swap_pairs(24),
            rep_out: PermutationRep::swap_pairs(6),
        }
    }
}

impl SweepConfig {
    /// Load a config from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SweepConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InspectError> {
        if self.num_channels == 0 {
            return Err(InspectError::InvalidConfig("num_channels must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(InspectError::InvalidConfig("batch_size must be positive".into()));
        }
        self.rep_in.validate()?;
        self.rep_out.validate()?;
        Ok(())
    }

    /// Whether an (architecture, init mode) pairing is meaningful
    pub fn is_valid_combination(&self, model_type: ModelType, init_mode: InitMode) -> bool {
        !init_mode.requires_basis() || model_type.is_basis_decomposed()
    }

    /// Valid combinations in sweep order
    pub fn combinations(&self) -> Vec<(ModelType, InitMode)> {
        self.model_types
            .iter()
            .flat_map(|&m| self.init_modes.iter().map(move |&i| (m, i)))
            .filter(|&(m, i)| self.is_valid_combination(m, i))
            .collect()
    }

    pub fn architecture(&self) -> ArchitectureSpec {
        ArchitectureSpec {
            rep_in: self.rep_in.clone(),
            rep_out: self.rep_out.clone(),
            num_layers: self.num_layers,
            num_channels: self.num_channels,
            activation: self.activation,
            with_bias: self.with_bias,
        }
    }

    /// Total layer count of every model the sweep builds
    pub fn total_layers(&self) -> usize {
        self.num_layers + 2
    }
}

/// Grand tables spanning a whole sweep
#[derive(Debug)]
pub struct SweepResults {
    pub weights: LongTable,
    pub gradients: LongTable,
    pub activations: LongTable,
    /// Combinations that were measured, in order
    pub combinations: Vec<(ModelType, InitMode)>,
}

/// Main sweep runner
pub struct Sweep {
    config: SweepConfig,
    models: Box<dyn ModelFactory>,
    data: Box<dyn DataFactory>,
}

impl Sweep {
    pub fn new(config: SweepConfig, models: Box<dyn ModelFactory>, data: Box<dyn DataFactory>) -> Self {
        Self {
            config,
            models,
            data,
        }
    }

    /// Sweep with the seeded MLP/EMLP factory and synthetic symmetric data
    pub fn from_config(config: SweepConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let models = SweepModelFactory::new(config.architecture(), config.seed, device.clone())?;
        let data = SyntheticData {
            rep_in: config.rep_in.clone(),
            rep_out: config.rep_out.clone(),
            batch_size: config.batch_size,
            seed: config.seed,
            device: device.clone(),
        };
        Ok(Self::new(config, Box::new(models), Box::new(data)))
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run every valid combination. The first failure aborts the sweep and no
    /// partial tables are returned.
    pub fn run(&self) -> Result<SweepResults> {
        info!("Starting layer statistics sweep");
        info!("Config: {:?}", self.config);

        let mut weights = LongTable::new(StatFamily::Weights);
        let mut gradients = LongTable::new(StatFamily::Gradients);
        let mut activations = LongTable::new(StatFamily::Activations);
        let mut combinations = Vec::new();

        for &model_type in &self.config.model_types {
            for &init_mode in &self.config.init_modes {
                if !self.config.is_valid_combination(model_type, init_mode) {
                    debug!("Skipping {} / {}: not defined for this architecture", model_type, init_mode);
                    continue;
                }
                info!("Extracting {} / {}", model_type, init_mode);

                let (w, g, a) = self
                    .run_combination(model_type, init_mode)
                    .with_context(|| format!("Sweep aborted at {model_type} / {init_mode}"))?;
                info!(
                    "{} / {}: {} weight rows, {} gradient rows, {} activation rows",
                    model_type,
                    init_mode,
                    w.len(),
                    g.len(),
                    a.len()
                );

                weights.append(w)?;
                gradients.append(g)?;
                activations.append(a)?;
                combinations.push((model_type, init_mode));
            }
        }

        for table in [&weights, &gradients, &activations] {
            let non_finite = table.non_finite_count();
            if non_finite > 0 {
                warn!(
                    "{} table holds {} non-finite values",
                    table.family().value_column(),
                    non_finite
                );
            }
        }
        info!("Sweep finished: {} combinations", combinations.len());

        Ok(SweepResults {
            weights,
            gradients,
            activations,
            combinations,
        })
    }

    /// Extract all three families for one combination, tagged with its facets
    fn run_combination(
        &self,
        model_type: ModelType,
        init_mode: InitMode,
    ) -> Result<(LongTable, LongTable, LongTable)> {
        let network = self.models.build(model_type, init_mode)?;
        let batch = self.data.fresh_source()?.next_batch()?;

        let activations = extract_activations(&network, &batch)?;
        let gradients = extract_gradients(&network, &batch)?;
        let weights = extract_weights(&network)?;

        let (m, i) = (model_type.as_str(), init_mode.as_str());
        Ok((
            weights.to_table()?.with_facets(m, i),
            gradients.to_table()?.with_facets(m, i),
            activations.to_table().with_facets(m, i),
        ))
    }
}

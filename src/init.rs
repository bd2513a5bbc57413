//! Initialization modes for learnable tensors

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{Device, Shape, Tensor, Var};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::error::InspectError;

/// Named scheme for populating a layer's learnable tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InitMode {
    #[serde(rename = "fan_in")]
    FanIn,
    #[serde(rename = "fan_out")]
    FanOut,
    #[serde(rename = "normal0.1")]
    Normal01,
    #[serde(rename = "normal1.0")]
    Normal10,
    /// Scales by the mean of fan-in and fan-out; only defined for basis-decomposed layers
    #[serde(rename = "arithmetic_mean")]
    ArithmeticMean,
}

impl InitMode {
    pub const ALL: [InitMode; 5] = [
        InitMode::FanIn,
        InitMode::FanOut,
        InitMode::Normal01,
        InitMode::Normal10,
        InitMode::ArithmeticMean,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InitMode::FanIn => "fan_in",
            InitMode::FanOut => "fan_out",
            InitMode::Normal01 => "normal0.1",
            InitMode::Normal10 => "normal1.0",
            InitMode::ArithmeticMean => "arithmetic_mean",
        }
    }

    /// Whether this mode only makes sense for basis-decomposed layers
    pub fn requires_basis(self) -> bool {
        matches!(self, InitMode::ArithmeticMean)
    }

    /// Standard deviation of the zero-mean normal the tensor is drawn from
    pub fn std_dev(self, fan_in: usize, fan_out: usize) -> f64 {
        match self {
            InitMode::FanIn => (2.0 / fan_in.max(1) as f64).sqrt(),
            InitMode::FanOut => (2.0 / fan_out.max(1) as f64).sqrt(),
            InitMode::Normal01 => 0.1,
            InitMode::Normal10 => 1.0,
            InitMode::ArithmeticMean => {
                let fan = (fan_in + fan_out) as f64 / 2.0;
                (2.0 / fan.max(1.0)).sqrt()
            }
        }
    }
}

impl fmt::Display for InitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitMode {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InitMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| InspectError::InvalidConfig(format!("unknown init mode '{s}'")))
    }
}

/// Seeded source of normal draws; the same seed always yields the same tensors
pub struct Initializer {
    rng: StdRng,
}

impl Initializer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self, n: usize, std_dev: f64) -> Result<Vec<f32>> {
        let normal = Normal::new(0.0, std_dev)
            .map_err(|e| anyhow::anyhow!("Invalid normal std {std_dev}: {e}"))?;
        Ok((0..n).map(|_| normal.sample(&mut self.rng) as f32).collect())
    }

    pub fn tensor<S: Into<Shape>>(&mut self, shape: S, std_dev: f64, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data = self.sample(shape.elem_count(), std_dev)?;
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    pub fn var<S: Into<Shape>>(&mut self, shape: S, std_dev: f64, device: &Device) -> Result<Var> {
        Ok(Var::from_tensor(&self.tensor(shape, std_dev, device)?)?)
    }
}

//! Batch sources feeding the gradient and activation extractors
//!
//! Extraction always uses a single batch: the first one a freshly built source
//! yields. Statistics describe one sample of the loss landscape, not the dataset.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::basis::{equivariant_basis, PermutationRep};
use crate::init::Initializer;

/// One `(features, targets)` pair
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Tensor,
    pub targets: Tensor,
}

impl Batch {
    pub fn new(features: Tensor, targets: Tensor) -> Result<Self> {
        let n_features = features.dim(0)?;
        let n_targets = targets.dim(0)?;
        anyhow::ensure!(
            n_features == n_targets,
            "batch has {n_features} feature rows but {n_targets} target rows"
        );
        Ok(Self { features, targets })
    }

    pub fn batch_size(&self) -> usize {
        self.features.dims().first().copied().unwrap_or(0)
    }
}

/// Anything that yields batches
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Seeded synthetic regression data with a symmetric target map.
///
/// Features are standard normal; targets are `y = M x` where `M` lies in the
/// equivariant subspace of the given representations, so the task carries the
/// same symmetry the basis-decomposed models are built for.
pub struct SyntheticBatches {
    init: Initializer,
    mapping: Tensor,
    batch_size: usize,
    device: Device,
}

impl SyntheticBatches {
    pub fn new(
        rep_in: &PermutationRep,
        rep_out: &PermutationRep,
        batch_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch size must be positive");
        let mut init = Initializer::new(seed);
        let basis = equivariant_basis(rep_in, rep_out, device)?;
        let (n_out, n_in, n_basis) = basis.dims3()?;
        let coeff = init.tensor((n_basis, 1), 1.0, device)?;
        let mapping = basis
            .reshape((n_out * n_in, n_basis))?
            .matmul(&coeff)?
            .reshape((n_out, n_in))?;
        Ok(Self {
            init,
            mapping,
            batch_size,
            device: device.clone(),
        })
    }

    pub fn in_features(&self) -> usize {
        self.mapping.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.mapping.dims()[0]
    }
}

impl BatchSource for SyntheticBatches {
    fn next_batch(&mut self) -> Result<Batch> {
        let features = self
            .init
            .tensor((self.batch_size, self.in_features()), 1.0, &self.device)?;
        let targets = features.matmul(&self.mapping.t()?)?;
        Batch::new(features, targets)
    }
}

/// A source that hands out the same batch forever, for tests and replays
pub struct FixedBatch(pub Batch);

impl BatchSource for FixedBatch {
    fn next_batch(&mut self) -> Result<Batch> {
        Ok(self.0.clone())
    }
}

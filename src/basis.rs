//! Equivariant bases for groups acting by channel permutations
//!
//! For permutation representations `P_in`, `P_out` of the same group, the maps
//! `W` satisfying `P_out W = W P_in` for every generator are exactly the maps that
//! are constant on the orbits of the index pairs `(i, j) -> (g_out(i), g_in(j))`.
//! The basis has one indicator matrix per orbit.

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::InspectError;

/// A group acting on `dim` channels, given by the permutation of each generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationRep {
    dim: usize,
    generators: Vec<Vec<usize>>,
}

impl PermutationRep {
    pub fn new(dim: usize, generators: Vec<Vec<usize>>) -> Result<Self, InspectError> {
        let rep = Self { dim, generators };
        rep.validate()?;
        Ok(rep)
    }

    /// One generator acting as the identity
    pub fn trivial(dim: usize) -> Self {
        Self {
            dim,
            generators: vec![(0..dim).collect()],
        }
    }

    /// One involution swapping channels `(0, 1), (2, 3), ...`; an odd last channel stays fixed.
    ///
    /// This is the regular representation of C2 repeated `dim / 2` times.
    pub fn swap_pairs(dim: usize) -> Self {
        Self::swap_pairs_with_generators(dim, 1)
    }

    /// The pair swap repeated for each of `n_generators` generators
    pub fn swap_pairs_with_generators(dim: usize, n_generators: usize) -> Self {
        let swap: Vec<usize> = (0..dim)
            .map(|i| {
                let partner = i ^ 1;
                if partner < dim {
                    partner
                } else {
                    i
                }
            })
            .collect();
        Self {
            dim,
            generators: vec![swap; n_generators],
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn generators(&self) -> &[Vec<usize>] {
        &self.generators
    }

    pub fn validate(&self) -> Result<(), InspectError> {
        if self.dim == 0 {
            return Err(InspectError::InvalidConfig(
                "representation dimension must be positive".into(),
            ));
        }
        for (g, perm) in self.generators.iter().enumerate() {
            if perm.len() != self.dim {
                return Err(InspectError::InvalidConfig(format!(
                    "generator {g} permutes {} channels, expected {}",
                    perm.len(),
                    self.dim
                )));
            }
            let mut seen = vec![false; self.dim];
            for &target in perm {
                if target >= self.dim || seen[target] {
                    return Err(InspectError::InvalidConfig(format!(
                        "generator {g} is not a permutation of 0..{}",
                        self.dim
                    )));
                }
                seen[target] = true;
            }
        }
        Ok(())
    }
}

/// Union-find over `out * in` index pairs
struct Orbits {
    parent: Vec<usize>,
}

impl Orbits {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Orbit id of every `(i, j)` cell in row-major order, ids numbered by first appearance
pub fn orbit_ids(rep_in: &PermutationRep, rep_out: &PermutationRep) -> Result<(Vec<usize>, usize)> {
    rep_in.validate()?;
    rep_out.validate()?;
    if rep_in.generators.len() != rep_out.generators.len() {
        return Err(InspectError::InvalidConfig(format!(
            "input representation has {} generators, output has {}",
            rep_in.generators.len(),
            rep_out.generators.len()
        ))
        .into());
    }

    let (n_out, n_in) = (rep_out.dim, rep_in.dim);
    let mut orbits = Orbits::new(n_out * n_in);
    for (g_in, g_out) in rep_in.generators.iter().zip(&rep_out.generators) {
        for i in 0..n_out {
            for j in 0..n_in {
                orbits.union(i * n_in + j, g_out[i] * n_in + g_in[j]);
            }
        }
    }

    let mut dense_id = vec![usize::MAX; n_out * n_in];
    let mut ids = Vec::with_capacity(n_out * n_in);
    let mut n_orbits = 0;
    for cell in 0..n_out * n_in {
        let root = orbits.find(cell);
        if dense_id[root] == usize::MAX {
            dense_id[root] = n_orbits;
            n_orbits += 1;
        }
        ids.push(dense_id[root]);
    }
    Ok((ids, n_orbits))
}

/// Equivariant basis of shape `(out, in, n_orbits)`
pub fn equivariant_basis(
    rep_in: &PermutationRep,
    rep_out: &PermutationRep,
    device: &Device,
) -> Result<Tensor> {
    let (ids, n_orbits) = orbit_ids(rep_in, rep_out)?;
    let mut data = vec![0f32; ids.len() * n_orbits];
    for (cell, &orbit) in ids.iter().enumerate() {
        data[cell * n_orbits + orbit] = 1.0;
    }
    Ok(Tensor::from_vec(
        data,
        (rep_out.dim, rep_in.dim, n_orbits),
        device,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_pairs_odd_dim() {
        let rep = PermutationRep::swap_pairs(5);
        assert_eq!(rep.generators()[0], vec![1, 0, 3, 2, 4]);
        assert!(rep.validate().is_ok());
    }

    #[test]
    fn test_invalid_permutation() {
        assert!(PermutationRep::new(3, vec![vec![0, 0, 1]]).is_err());
        assert!(PermutationRep::new(3, vec![vec![0, 1]]).is_err());
        assert!(PermutationRep::new(0, vec![]).is_err());
    }

    #[test]
    fn test_trivial_basis_is_one_orbit_per_cell() {
        let (ids, n) = orbit_ids(&PermutationRep::trivial(2), &PermutationRep::trivial(3)).unwrap();
        assert_eq!(n, 6);
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_c2_orbits_halve_the_cells() {
        let (ids, n) =
            orbit_ids(&PermutationRep::swap_pairs(2), &PermutationRep::swap_pairs(2)).unwrap();
        // W = [[a, b], [b, a]]
        assert_eq!(n, 2);
        assert_eq!(ids, vec![0, 1, 1, 0]);
    }

    #[test]
    fn test_basis_is_equivariant() {
        let device = Device::Cpu;
        let rep_in = PermutationRep::swap_pairs(4);
        let rep_out = PermutationRep::swap_pairs(3);
        let basis = equivariant_basis(&rep_in, &rep_out, &device).unwrap();
        let (out, inp, n) = basis.dims3().unwrap();
        assert_eq!((out, inp), (3, 4));

        let coeff: Vec<f32> = (0..n).map(|k| k as f32 + 1.0).collect();
        let coeff = Tensor::from_vec(coeff, (n, 1), &device).unwrap();
        let weight: Vec<f32> = basis
            .reshape((out * inp, n))
            .unwrap()
            .matmul(&coeff)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        let g_in = &rep_in.generators()[0];
        let g_out = &rep_out.generators()[0];
        for i in 0..out {
            for j in 0..inp {
                assert_eq!(weight[i * inp + j], weight[g_out[i] * inp + g_in[j]]);
            }
        }
    }

    #[test]
    fn test_generator_count_mismatch() {
        let rep_in = PermutationRep::swap_pairs_with_generators(2, 2);
        let rep_out = PermutationRep::swap_pairs(2);
        let err = equivariant_basis(&rep_in, &rep_out, &Device::Cpu).unwrap_err();
        assert!(err.downcast_ref::<InspectError>().is_some());
    }
}

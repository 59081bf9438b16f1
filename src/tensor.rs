//! UTIL tensors: `combine` (join), `project` (eliminate a variable), and
//! the own-constraint fold-in, grounded on
//! `original_source/app/helpers/managers/util_manager.py`
//! (`combine`/`project`/`add_my_utility_in`, there built on `numpy`).
//!
//! No `ndarray`/`nalgebra`: the teacher's stack carries no tensor-math
//! dependency, and DPOP's join/projection reshape irregularly in ways
//! simpler to hand-roll over a flat `Vec<Cost>` + explicit `shape` than
//! to fit into a fixed-rank tensor crate's API (SPEC_FULL.md §4.4/§9).
//!
//! Every tensor tracks `vars`: the agent ids its axes are indexed over,
//! in the same order as `shape`/`data`. `combine` joins two tensors on
//! whichever variables they share (by id, not by axis position) and
//! takes the union of the rest — this is the resolved semantics for the
//! "sparse/dense combine" Open Question (DESIGN.md #2), a proper
//! variable-identity join rather than the original's shape-position
//! `+=`, which only coincidentally works on the topologies the source
//! ships with.

use crate::domain::{saturating_cost_sum, Cost, INFINITY};
use crate::message::{UtilPayload, UtilRow};
use crate::topology::AgentId;
use crate::{DpopError, Result};

/// A UTIL/JOIN tensor: dense when its cell count is small enough to
/// materialize in full, sparse (only the finite-cost rows kept) once a
/// join would otherwise exceed the configured cap — e.g. a zone's
/// multi-room internal join. `INFINITY` is the implicit cost of any
/// combination a sparse tensor doesn't list.
#[derive(Debug, Clone, PartialEq)]
pub enum UtilityTensor {
    /// Every cell of `vars.len()` domain-sized axes, row-major.
    Dense { vars: Vec<AgentId>, shape: Vec<usize>, data: Vec<Cost> },
    /// Only the rows with a finite cost.
    Sparse { vars: Vec<AgentId>, rows: Vec<UtilRow> },
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut s = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        s[i] = s[i + 1] * shape[i + 1];
    }
    s
}

fn flat_index(shape: &[usize], idx: &[usize]) -> usize {
    idx.iter().zip(strides(shape)).map(|(i, s)| i * s).sum()
}

fn unravel(shape: &[usize], mut flat: usize) -> Vec<usize> {
    let strides = strides(shape);
    let mut idx = vec![0usize; shape.len()];
    for (i, &stride) in strides.iter().enumerate() {
        idx[i] = flat / stride;
        flat %= stride;
    }
    idx
}

impl UtilityTensor {
    /// A rank-1 tensor over just `own_var`: the private cost vector an
    /// area starts UTIL propagation from.
    pub fn local(own_var: AgentId, costs: Vec<Cost>) -> Self {
        let len = costs.len();
        UtilityTensor::Dense { vars: vec![own_var], shape: vec![len], data: costs }
    }

    /// Variable ids this tensor is indexed over, in axis order.
    pub fn vars(&self) -> &[AgentId] {
        match self {
            UtilityTensor::Dense { vars, .. } => vars,
            UtilityTensor::Sparse { vars, .. } => vars,
        }
    }

    /// Number of variables (tensor rank).
    pub fn rank(&self) -> usize {
        self.vars().len()
    }

    /// Every `(indices, cost)` pair, indices aligned with `vars()`.
    /// Dense yields every cell; Sparse yields only its listed rows.
    pub fn entries(&self) -> Vec<(Vec<usize>, Cost)> {
        match self {
            UtilityTensor::Dense { shape, data, .. } => {
                (0..data.len()).map(|flat| (unravel(shape, flat), data[flat])).collect()
            }
            UtilityTensor::Sparse { rows, .. } => rows
                .iter()
                .map(|row| {
                    let (idx, cost) = row.split_at(row.len() - 1);
                    (idx.iter().map(|&v| v as usize).collect(), cost[0])
                })
                .collect(),
        }
    }

    /// Cost at `idx` (aligned with `vars()`); `INFINITY` if a sparse
    /// tensor doesn't list this combination.
    pub fn get(&self, idx: &[usize]) -> Cost {
        match self {
            UtilityTensor::Dense { shape, data, .. } => data[flat_index(shape, idx)],
            UtilityTensor::Sparse { rows, .. } => rows
                .iter()
                .find(|row| row[..row.len() - 1].iter().map(|&v| v as usize).eq(idx.iter().copied()))
                .map(|row| row[row.len() - 1])
                .unwrap_or(INFINITY),
        }
    }

    /// Join two tensors on whatever variables they share, taking the
    /// union of the rest, summing costs at matching cells (saturating).
    /// Produces `Dense` when the output fits within `max_cells`,
    /// `Sparse` (finite-cost rows only) otherwise; a join whose sparse
    /// row count would still be unreasonable is rejected with
    /// [`DpopError::TensorRankOverflow`].
    pub fn combine(a: &UtilityTensor, b: &UtilityTensor, max_rank: usize) -> Result<UtilityTensor> {
        let shared: Vec<AgentId> = a.vars().iter().copied().filter(|v| b.vars().contains(v)).collect();
        let extra_b: Vec<AgentId> = b.vars().iter().copied().filter(|v| !a.vars().contains(v)).collect();
        let out_vars: Vec<AgentId> = a.vars().iter().copied().chain(extra_b.iter().copied()).collect();

        if out_vars.len() > max_rank {
            return Err(DpopError::TensorRankOverflow { rank: out_vars.len(), max: max_rank });
        }

        let a_entries = a.entries();
        let b_entries = b.entries();
        let a_pos: Vec<usize> = shared.iter().map(|v| a.vars().iter().position(|x| x == v).unwrap()).collect();
        let b_pos: Vec<usize> = shared.iter().map(|v| b.vars().iter().position(|x| x == v).unwrap()).collect();
        let extra_b_pos: Vec<usize> = extra_b.iter().map(|v| b.vars().iter().position(|x| x == v).unwrap()).collect();

        let mut out_rows: Vec<(Vec<usize>, Cost)> = Vec::new();
        for (idx_a, va) in &a_entries {
            for (idx_b, vb) in &b_entries {
                if a_pos.iter().zip(&b_pos).any(|(&ap, &bp)| idx_a[ap] != idx_b[bp]) {
                    continue;
                }
                let mut out_idx = idx_a.clone();
                out_idx.extend(extra_b_pos.iter().map(|&bp| idx_b[bp]));
                out_rows.push((out_idx, saturating_cost_sum([*va, *vb])));
            }
        }

        let domain_len = a.vars().first().map(|_| a_shape_hint(a)).unwrap_or(0).max(b_shape_hint(b));
        let cell_count: usize = out_vars.iter().map(|_| domain_len).product::<usize>().max(1);

        if cell_count <= max_cells(max_rank, domain_len) {
            let shape: Vec<usize> = out_vars.iter().map(|_| domain_len).collect();
            let mut data = vec![INFINITY; cell_count];
            for (idx, cost) in out_rows {
                let flat = flat_index(&shape, &idx);
                data[flat] = data[flat].min(cost);
            }
            Ok(UtilityTensor::Dense { vars: out_vars, shape, data })
        } else {
            let rows: Vec<UtilRow> = out_rows
                .into_iter()
                .filter(|(_, cost)| *cost < INFINITY)
                .map(|(idx, cost)| idx.into_iter().map(|i| i as Cost).chain(std::iter::once(cost)).collect())
                .collect();
            Ok(UtilityTensor::Sparse { vars: out_vars, rows })
        }
    }

    /// Eliminate `var` by taking the minimum cost over its axis —
    /// DPOP's projection step, removing an agent from the message sent
    /// to its parent.
    pub fn project(&self, var: AgentId) -> UtilityTensor {
        let pos = self.vars().iter().position(|&v| v == var).expect("var not present in tensor");
        let mut new_vars = self.vars().to_vec();
        new_vars.remove(pos);

        let mut best: std::collections::HashMap<Vec<usize>, Cost> = std::collections::HashMap::new();
        for (mut idx, cost) in self.entries() {
            idx.remove(pos);
            best.entry(idx).and_modify(|c| *c = (*c).min(cost)).or_insert(cost);
        }

        match self {
            UtilityTensor::Dense { shape, .. } => {
                let mut new_shape = shape.clone();
                new_shape.remove(pos);
                let cell_count = new_shape.iter().product::<usize>().max(1);
                let mut data = vec![INFINITY; cell_count];
                for (idx, cost) in best {
                    let flat = flat_index(&new_shape, &idx);
                    data[flat] = cost;
                }
                UtilityTensor::Dense { vars: new_vars, shape: new_shape, data }
            }
            UtilityTensor::Sparse { .. } => {
                let rows = best
                    .into_iter()
                    .map(|(idx, cost)| idx.into_iter().map(|i| i as Cost).chain(std::iter::once(cost)).collect())
                    .collect();
                UtilityTensor::Sparse { vars: new_vars, rows }
            }
        }
    }

    /// Fold `costs` (one per domain value, indexed by `own_var`) into
    /// this tensor, adding them along `own_var`'s axis. Mirrors
    /// `add_my_utility_in`.
    pub fn add_own_costs(&self, own_var: AgentId, costs: &[Cost]) -> UtilityTensor {
        let pos = self.vars().iter().position(|&v| v == own_var).expect("own_var not present");
        match self {
            UtilityTensor::Dense { vars, shape, data } => {
                let strides = strides(shape);
                let mut out = data.clone();
                for (flat, cell) in out.iter_mut().enumerate() {
                    let own_idx = (flat / strides[pos]) % shape[pos];
                    *cell = saturating_cost_sum([*cell, costs[own_idx]]);
                }
                UtilityTensor::Dense { vars: vars.clone(), shape: shape.clone(), data: out }
            }
            UtilityTensor::Sparse { vars, rows } => {
                let out = rows
                    .iter()
                    .map(|row| {
                        let mut row = row.clone();
                        let own_idx = row[pos] as usize;
                        let last = row.len() - 1;
                        row[last] = saturating_cost_sum([row[last], costs[own_idx]]);
                        row
                    })
                    .collect();
                UtilityTensor::Sparse { vars: vars.clone(), rows: out }
            }
        }
    }

    /// The wire `UTIL <json>` payload for this (already-projected)
    /// tensor.
    pub fn to_payload(&self) -> UtilPayload {
        let rows = self
            .entries()
            .into_iter()
            .map(|(idx, cost)| idx.into_iter().map(|i| i as Cost).chain(std::iter::once(cost)).collect())
            .collect();
        UtilPayload { vars: self.vars().to_vec(), data: rows }
    }

    /// Rebuild a tensor from a received `UTIL <json>` payload.
    /// `domain_len` drives whether the result densifies.
    pub fn from_payload(payload: &UtilPayload, domain_len: usize, max_rank: usize) -> UtilityTensor {
        let cell_count: usize = payload.vars.iter().map(|_| domain_len).product::<usize>().max(1);
        if payload.vars.len() <= max_rank && cell_count <= max_cells(max_rank, domain_len) {
            let shape: Vec<usize> = payload.vars.iter().map(|_| domain_len).collect();
            let mut data = vec![INFINITY; cell_count];
            for row in &payload.data {
                let (idx_part, cost) = row.split_at(row.len() - 1);
                let idx: Vec<usize> = idx_part.iter().map(|&v| v as usize).collect();
                let flat = flat_index(&shape, &idx);
                data[flat] = cost[0];
            }
            UtilityTensor::Dense { vars: payload.vars.clone(), shape, data }
        } else {
            UtilityTensor::Sparse { vars: payload.vars.clone(), rows: payload.data.clone() }
        }
    }
}

fn a_shape_hint(t: &UtilityTensor) -> usize {
    match t {
        UtilityTensor::Dense { shape, .. } => shape.first().copied().unwrap_or(0),
        UtilityTensor::Sparse { .. } => 0,
    }
}

fn b_shape_hint(t: &UtilityTensor) -> usize {
    a_shape_hint(t)
}

fn max_cells(max_rank: usize, domain_len: usize) -> usize {
    domain_len.max(1).pow(max_rank.min(8) as u32)
}

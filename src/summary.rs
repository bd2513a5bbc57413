//! Per-layer descriptive statistics over a long table

use std::collections::BTreeMap;

use serde::Serialize;
use statrs::statistics::Statistics;

use crate::table::{LongTable, ParamKind};

/// Distribution summary of one (model type, init mode, layer, kind) group
#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub model_type: Option<String>,
    pub init_mode: Option<String>,
    pub layer: usize,
    pub param: ParamKind,
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

type GroupKey = (Option<String>, Option<String>, usize, ParamKind);

/// Summarize every group present in the table, in key order.
///
/// `std_dev` is the sample standard deviation and is `NaN` for single-value groups.
pub fn summarize(table: &LongTable) -> Vec<LayerSummary> {
    let mut groups: BTreeMap<GroupKey, Vec<f64>> = BTreeMap::new();
    for row in table.rows() {
        groups
            .entry((
                row.model_type.clone(),
                row.init_mode.clone(),
                row.layer,
                row.param,
            ))
            .or_default()
            .push(f64::from(row.value));
    }

    groups
        .into_iter()
        .map(|((model_type, init_mode, layer, param), values)| LayerSummary {
            model_type,
            init_mode,
            layer,
            param,
            count: values.len(),
            mean: Statistics::mean(values.iter()),
            std_dev: Statistics::std_dev(values.iter()),
            min: Statistics::min(values.iter()),
            max: Statistics::max(values.iter()),
        })
        .collect()
}

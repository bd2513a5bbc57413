//! Long-format tables: one row per scalar, tagged by layer, kind and facets
//!
//! Per-layer arrays are ragged (each layer has its own element count), so the
//! rows are produced straight from each layer's array. No rectangular
//! intermediate is built, which means no padding cell can ever reach a table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

/// What a value in a table measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamKind {
    #[serde(rename = "W")]
    W,
    #[serde(rename = "c")]
    Coeff,
    #[serde(rename = "basis")]
    Basis,
    #[serde(rename = "Grad")]
    Grad,
    #[serde(rename = "c-grad")]
    CoeffGrad,
    #[serde(rename = "Activation")]
    Activation,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamKind::W => "W",
            ParamKind::Coeff => "c",
            ParamKind::Basis => "basis",
            ParamKind::Grad => "Grad",
            ParamKind::CoeffGrad => "c-grad",
            ParamKind::Activation => "Activation",
        }
    }

    pub fn family(self) -> StatFamily {
        match self {
            ParamKind::W | ParamKind::Coeff | ParamKind::Basis => StatFamily::Weights,
            ParamKind::Grad | ParamKind::CoeffGrad => StatFamily::Gradients,
            ParamKind::Activation => StatFamily::Activations,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group of kinds that share one grand table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatFamily {
    Weights,
    Gradients,
    Activations,
}

impl StatFamily {
    /// Name of the value column downstream consumers filter on
    pub fn value_column(self) -> &'static str {
        match self {
            StatFamily::Weights => "Param_Value",
            StatFamily::Gradients => "Grad",
            StatFamily::Activations => "Activation",
        }
    }

    pub fn kinds(self) -> &'static [ParamKind] {
        match self {
            StatFamily::Weights => &[ParamKind::W, ParamKind::Coeff, ParamKind::Basis],
            StatFamily::Gradients => &[ParamKind::Grad, ParamKind::CoeffGrad],
            StatFamily::Activations => &[ParamKind::Activation],
        }
    }
}

pub const LAYER_COLUMN: &str = "Layer";
pub const PARAM_COLUMN: &str = "Param";
pub const MODEL_TYPE_COLUMN: &str = "Model Type";
pub const INIT_MODE_COLUMN: &str = "Initialization Mode";

/// One scalar observation
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub layer: usize,
    pub value: f32,
    pub param: ParamKind,
    pub model_type: Option<String>,
    pub init_mode: Option<String>,
}

/// A relational table of [`Row`]s belonging to one [`StatFamily`]
#[derive(Debug, Clone)]
pub struct LongTable {
    family: StatFamily,
    rows: Vec<Row>,
}

impl LongTable {
    pub fn new(family: StatFamily) -> Self {
        Self {
            family,
            rows: Vec::new(),
        }
    }

    /// Melt a ragged per-layer mapping into rows tagged with `kind`.
    ///
    /// Rows come out in ascending layer order, element order within a layer.
    pub fn from_layers(layers: &BTreeMap<usize, Vec<f32>>, kind: ParamKind) -> Self {
        let n_rows = layers.values().map(Vec::len).sum();
        let mut rows = Vec::with_capacity(n_rows);
        for (&layer, values) in layers {
            rows.extend(values.iter().map(|&value| Row {
                layer,
                value,
                param: kind,
                model_type: None,
                init_mode: None,
            }));
        }
        Self {
            family: kind.family(),
            rows,
        }
    }

    /// Vertically concatenate kind-tables of one family
    pub fn union(family: StatFamily, tables: impl IntoIterator<Item = LongTable>) -> Result<Self> {
        let mut out = Self::new(family);
        for table in tables {
            out.append(table)?;
        }
        Ok(out)
    }

    /// Move all rows of `other` into this table
    pub fn append(&mut self, mut other: LongTable) -> Result<()> {
        anyhow::ensure!(
            other.family == self.family,
            "cannot append a {:?} table to a {:?} table",
            other.family,
            self.family
        );
        self.rows.append(&mut other.rows);
        Ok(())
    }

    /// Tag every row with the architecture variant and initialization mode
    pub fn with_facets(mut self, model_type: &str, init_mode: &str) -> Self {
        for row in &mut self.rows {
            row.model_type = Some(model_type.to_string());
            row.init_mode = Some(init_mode.to_string());
        }
        self
    }

    pub fn family(&self) -> StatFamily {
        self.family
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows for one (layer, kind) pair
    pub fn count(&self, layer: usize, kind: ParamKind) -> usize {
        self.rows
            .iter()
            .filter(|r| r.layer == layer && r.param == kind)
            .count()
    }

    /// Row counts for every (layer, kind) pair present
    pub fn counts(&self) -> BTreeMap<(usize, ParamKind), usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry((row.layer, row.param)).or_insert(0) += 1;
        }
        counts
    }

    pub fn values_for(&self, layer: usize, kind: ParamKind) -> Vec<f32> {
        self.rows
            .iter()
            .filter(|r| r.layer == layer && r.param == kind)
            .map(|r| r.value)
            .collect()
    }

    pub fn layers(&self) -> BTreeSet<usize> {
        self.rows.iter().map(|r| r.layer).collect()
    }

    pub fn filter(&self, predicate: impl Fn(&Row) -> bool) -> Self {
        Self {
            family: self.family,
            rows: self.rows.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    /// Rows for one model type, the way per-architecture plots slice the grand table
    pub fn for_model_type(&self, model_type: &str) -> Self {
        self.filter(|r| r.model_type.as_deref() == Some(model_type))
    }

    pub fn non_finite_count(&self) -> usize {
        self.rows.iter().filter(|r| !r.value.is_finite()).count()
    }

    /// Write the table as a JSON array of records
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }
}

struct Record<'a> {
    row: &'a Row,
    value_column: &'static str,
}

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let row = self.row;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(LAYER_COLUMN, &row.layer)?;
        map.serialize_entry(self.value_column, &row.value)?;
        map.serialize_entry(PARAM_COLUMN, &row.param)?;
        if let Some(model_type) = &row.model_type {
            map.serialize_entry(MODEL_TYPE_COLUMN, model_type)?;
        }
        if let Some(init_mode) = &row.init_mode {
            map.serialize_entry(INIT_MODE_COLUMN, init_mode)?;
        }
        map.end()
    }
}

impl Serialize for LongTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value_column = self.family.value_column();
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in &self.rows {
            seq.serialize_element(&Record { row, value_column })?;
        }
        seq.end()
    }
}

//! Per-(instrument, target) member weights derived from recent accuracy.

use crate::domain::prediction::PredictionTarget;
use crate::domain::signal::InstrumentKey;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Immutable weight table. Replaced wholesale on reweight, never edited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightTable {
    default_row: HashMap<String, f64>,
    rows: HashMap<(InstrumentKey, PredictionTarget), HashMap<String, f64>>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_row(mut self, row: HashMap<String, f64>) -> Self {
        self.default_row = sanitize(row);
        self
    }

    pub fn with_row(
        mut self,
        instrument: InstrumentKey,
        target: PredictionTarget,
        row: HashMap<String, f64>,
    ) -> Self {
        self.rows.insert((instrument, target), sanitize(row));
        self
    }

    /// Raw (unnormalized) weight for each member, in order.
    ///
    /// Lookup falls back from the (instrument, target) row to the default row
    /// and finally to equal weights. A member absent from a chosen row gets 0.
    pub fn weights_for(
        &self,
        instrument: &InstrumentKey,
        target: PredictionTarget,
        members: &[&str],
    ) -> Vec<f64> {
        let row = self
            .rows
            .get(&(instrument.clone(), target))
            .or((!self.default_row.is_empty()).then_some(&self.default_row));
        match row {
            Some(row) => members
                .iter()
                .map(|m| row.get(*m).copied().unwrap_or(0.0))
                .collect(),
            None => vec![1.0; members.len()],
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Parse a weight file.
    ///
    /// ```toml
    /// [default]
    /// linear_sentiment = 0.58
    /// sequence_returns = 0.52
    ///
    /// [[entries]]
    /// instrument = "AAPL"
    /// target = "direction_60m"
    /// weights = { linear_sentiment = 0.61, sequence_returns = 0.49 }
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: WeightFile = toml::from_str(content).context("Failed to parse weight table TOML")?;
        let mut table = Self::new().with_default_row(file.default);
        for entry in file.entries {
            let target: PredictionTarget = entry
                .target
                .parse()
                .context(format!("Invalid target in weight table: {}", entry.target))?;
            table = table.with_row(
                InstrumentKey::new(entry.instrument.trim().to_uppercase()),
                target,
                entry.weights,
            );
        }
        Ok(table)
    }
}

/// Negative and non-finite accuracies become 0.
fn sanitize(row: HashMap<String, f64>) -> HashMap<String, f64> {
    row.into_iter()
        .map(|(k, v)| (k, if v.is_finite() { v.max(0.0) } else { 0.0 }))
        .collect()
}

#[derive(Debug, Deserialize)]
struct WeightFile {
    #[serde(default)]
    default: HashMap<String, f64>,
    #[serde(default)]
    entries: Vec<WeightEntry>,
}

#[derive(Debug, Deserialize)]
struct WeightEntry {
    instrument: String,
    target: String,
    weights: HashMap<String, f64>,
}

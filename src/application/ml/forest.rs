use crate::application::ml::scoring_model::ModelMeta;
use crate::domain::errors::EnsembleError;
use anyhow::{Context, Result};
use smartcore::ensemble::random_forest_regressor::RandomForestRegressor;
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Tree-ensemble member backed by a serialized smartcore random forest.
#[derive(Clone)]
pub struct ForestModel {
    pub meta: ModelMeta,
    /// Column order the forest was trained on
    pub feature_order: Vec<String>,
    forest: Arc<Forest>,
}

impl std::fmt::Debug for ForestModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForestModel")
            .field("meta", &self.meta)
            .field("feature_order", &self.feature_order)
            .field("forest", &"<RandomForestRegressor>")
            .finish()
    }
}

impl ForestModel {
    pub fn new(meta: ModelMeta, feature_order: Vec<String>, forest: Forest) -> Self {
        Self {
            meta,
            feature_order,
            forest: Arc::new(forest),
        }
    }

    /// Load a forest serialized as JSON.
    pub fn load(meta: ModelMeta, feature_order: Vec<String>, path: &Path) -> Result<Self> {
        let file = File::open(path).context(format!("Failed to open forest model {:?}", path))?;
        let forest: Forest = serde_json::from_reader(BufReader::new(file))
            .context(format!("Failed to deserialize forest model {:?}", path))?;
        info!(
            "ForestModel: loaded {} v{} from {:?} ({} features)",
            meta.name,
            meta.version,
            path,
            feature_order.len()
        );
        Ok(Self::new(meta, feature_order, forest))
    }

    pub fn predict_rows(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, EnsembleError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let scoring_error = |reason: String| EnsembleError::Scoring {
            model: self.meta.name.clone(),
            reason,
        };
        let matrix = DenseMatrix::from_2d_vec(&rows.to_vec())
            .map_err(|e| scoring_error(format!("Matrix creation failed: {}", e)))?;
        self.forest
            .predict(&matrix)
            .map_err(|e| scoring_error(format!("Prediction failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartcore::ensemble::random_forest_regressor::RandomForestRegressorParameters;
    use std::collections::BTreeMap;

    fn fitted() -> ForestModel {
        // y = 0.5 when momentum is positive, -0.5 otherwise
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            let momentum = (i as f64 - 20.0) / 100.0;
            let sentiment = ((i * 7) % 11) as f64 / 10.0 - 0.5;
            x.push(vec![momentum, sentiment]);
            y.push(if momentum > 0.0 { 0.5 } else { -0.5 });
        }
        let params = RandomForestRegressorParameters::default()
            .with_n_trees(10)
            .with_max_depth(4)
            .with_min_samples_split(2);
        let forest =
            RandomForestRegressor::fit(&DenseMatrix::from_2d_vec(&x).unwrap(), &y, params).unwrap();
        ForestModel::new(
            ModelMeta {
                name: "forest".to_string(),
                version: "0.1.0".to_string(),
                declared_variance: 0.05,
                base_confidence: 0.6,
                baseline: BTreeMap::new(),
            },
            vec!["technical.momentum".to_string(), "sentiment.score".to_string()],
            forest,
        )
    }

    #[test]
    fn test_predicts_batch() {
        let model = fitted();
        let out = model
            .predict_rows(&[vec![0.15, 0.0], vec![-0.15, 0.0]])
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0] > out[1]);
        assert!(model.predict_rows(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let model = fitted();
        let dir = std::env::temp_dir().join(format!("finsight-forest-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("forest.json");
        std::fs::write(&path, serde_json::to_string(model.forest.as_ref()).unwrap()).unwrap();

        let loaded = ForestModel::load(model.meta.clone(), model.feature_order.clone(), &path).unwrap();
        let rows = vec![vec![0.1, 0.2], vec![-0.3, -0.1]];
        assert_eq!(loaded.predict_rows(&rows).unwrap(), model.predict_rows(&rows).unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let model = fitted();
        let result = ForestModel::load(
            model.meta.clone(),
            model.feature_order.clone(),
            Path::new("/nonexistent/forest.json"),
        );
        assert!(result.is_err());
    }
}

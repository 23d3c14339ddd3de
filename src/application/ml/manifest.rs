use crate::application::ml::forest::ForestModel;
use crate::application::ml::scoring_model::{LinearModel, ModelMeta, ScoringModel, SequenceModel};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Versioned member set as written by the offline training job.
#[derive(Debug, Deserialize)]
struct ModelManifest {
    version: String,
    models: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ManifestEntry {
    Linear(LinearModel),
    Sequence(SequenceModel),
    Forest {
        meta: ModelMeta,
        feature_order: Vec<String>,
        /// Relative paths resolve against the manifest's directory
        path: PathBuf,
    },
}

/// Load a JSON manifest. Returns the manifest version and its members.
pub fn load_manifest(path: &Path) -> Result<(String, Vec<ScoringModel>)> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read model manifest {:?}", path))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_manifest(&content, base_dir)
}

pub fn parse_manifest(content: &str, base_dir: &Path) -> Result<(String, Vec<ScoringModel>)> {
    let manifest: ModelManifest =
        serde_json::from_str(content).context("Failed to parse model manifest")?;
    if manifest.models.is_empty() {
        anyhow::bail!("Model manifest {} lists no models", manifest.version);
    }

    let mut models = Vec::with_capacity(manifest.models.len());
    for entry in manifest.models {
        let model = match entry {
            ManifestEntry::Linear(m) => ScoringModel::Linear(m),
            ManifestEntry::Sequence(m) => ScoringModel::Sequence(m),
            ManifestEntry::Forest {
                meta,
                feature_order,
                path,
            } => {
                let path = if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                };
                ScoringModel::Forest(ForestModel::load(meta, feature_order, &path)?)
            }
        };
        if models.iter().any(|m: &ScoringModel| m.name() == model.name()) {
            anyhow::bail!("Duplicate model name in manifest: {}", model.name());
        }
        models.push(model);
    }
    Ok((manifest.version, models))
}

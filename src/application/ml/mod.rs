pub mod ensemble;
pub mod forest;
pub mod manifest;
pub mod scoring_model;
pub mod weights;

pub use ensemble::{EnsembleConfig, EnsembleSnapshot, ModelInfo, PredictionEnsemble};
pub use forest::ForestModel;
pub use scoring_model::{LinearModel, ModelMeta, ModelScore, ScoringModel, SequenceModel};
pub use weights::WeightTable;

pub mod explainer;
pub mod shapley;

pub use explainer::{ExplainabilityEngine, ExplainerConfig};

pub mod engine;
pub mod policy;

pub use engine::FusionEngine;
pub use policy::{FeatureSpec, FeatureTransform, FusionPolicy, OnMissing};

pub mod feature_cache;

pub use feature_cache::{CacheConfig, CacheWrite, FamilyWindowConfig, FeatureCache};

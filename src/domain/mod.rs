// Normalized signals and raw ingestion payloads
pub mod raw_event;
pub mod signal;

// Rolling per-key aggregates
pub mod window;

// Fusion output
pub mod features;

// Predictions and explanations
pub mod prediction;

// Port interfaces
pub mod ports;

// Repository traits
pub mod repositories;

// Domain-specific error types
pub mod errors;

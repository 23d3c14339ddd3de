pub mod bootstrap;
pub mod broadcast;
pub mod explainability;
pub mod fusion;
pub mod ingestion;
pub mod market_data;
pub mod ml;
pub mod system;

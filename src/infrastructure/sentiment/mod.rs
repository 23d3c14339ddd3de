pub mod vader;

pub use vader::VaderSentimentScorer;

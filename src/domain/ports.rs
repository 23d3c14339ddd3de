use crate::domain::signal::InstrumentKey;

/// Known-instrument registry. Resolves raw symbols (any case, aliases) to
/// canonical keys.
pub trait InstrumentRegistry: Send + Sync {
    fn resolve(&self, raw_key: &str) -> Option<InstrumentKey>;

    fn instruments(&self) -> Vec<InstrumentKey>;
}

/// Scores free text to a compound sentiment in [-1, 1].
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> f64;

    /// Title and body combined, title weighted 70%.
    fn score_article(&self, title: &str, body: &str) -> f64 {
        if body.trim().is_empty() {
            return self.score(title);
        }
        (self.score(title) * 0.7) + (self.score(body) * 0.3)
    }
}

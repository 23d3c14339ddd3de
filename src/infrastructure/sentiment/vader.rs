//! VADER compound score with an equity-market keyword boost.

use crate::domain::ports::SentimentScorer;
use vader_sentiment::SentimentIntensityAnalyzer;

/// Market jargon the general VADER lexicon misses. Single words match whole
/// tokens; phrases match as substrings of the lower-cased text.
const BULLISH_KEYWORDS: &[(&str, f64)] = &[
    ("surge", 0.4),
    ("surges", 0.4),
    ("rally", 0.4),
    ("rallies", 0.4),
    ("soars", 0.5),
    ("bullish", 0.5),
    ("upgrade", 0.3),
    ("upgraded", 0.3),
    ("outperform", 0.3),
    ("buyback", 0.3),
    ("breakout", 0.3),
    ("beats estimates", 0.5),
    ("record high", 0.4),
    ("all-time high", 0.5),
    ("raises guidance", 0.5),
    ("dividend increase", 0.3),
];

const BEARISH_KEYWORDS: &[(&str, f64)] = &[
    ("crash", -0.5),
    ("plunge", -0.5),
    ("plunges", -0.5),
    ("bearish", -0.5),
    ("downgrade", -0.4),
    ("downgraded", -0.4),
    ("underperform", -0.3),
    ("lawsuit", -0.4),
    ("probe", -0.3),
    ("recall", -0.3),
    ("fraud", -0.5),
    ("bankruptcy", -0.6),
    ("layoffs", -0.3),
    ("selloff", -0.4),
    ("sell-off", -0.4),
    ("misses estimates", -0.5),
    ("cuts guidance", -0.5),
    ("profit warning", -0.5),
];

pub struct VaderSentimentScorer {
    analyzer: SentimentIntensityAnalyzer<'static>,
    boost_weight: f64,
}

impl VaderSentimentScorer {
    pub fn new() -> Self {
        Self {
            analyzer: SentimentIntensityAnalyzer::new(),
            boost_weight: 0.5,
        }
    }

    fn financial_boost(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .filter(|t| !t.is_empty())
            .collect();

        BULLISH_KEYWORDS
            .iter()
            .chain(BEARISH_KEYWORDS.iter())
            .filter(|(keyword, _)| {
                if keyword.contains(' ') {
                    lower.contains(keyword)
                } else {
                    tokens.contains(keyword)
                }
            })
            .map(|(_, score)| score)
            .sum()
    }
}

impl Default for VaderSentimentScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentScorer for VaderSentimentScorer {
    fn score(&self, text: &str) -> f64 {
        if text.trim().is_empty() {
            return 0.0;
        }
        let compound = self.analyzer.polarity_scores(text)["compound"];
        (compound + self.financial_boost(text) * self.boost_weight).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bullish_headlines() {
        let scorer = VaderSentimentScorer::new();
        for headline in [
            "Apple beats estimates and raises guidance",
            "Analysts upgrade Microsoft after record high quarter",
            "Shares surge on buyback announcement",
        ] {
            let score = scorer.score(headline);
            assert!(score > 0.0, "Expected bullish score for '{}', got {}", headline, score);
        }
    }

    #[test]
    fn test_bearish_headlines() {
        let scorer = VaderSentimentScorer::new();
        for headline in [
            "Retailer cuts guidance, shares plunge",
            "Regulators open fraud probe into lender",
            "Automaker announces recall and layoffs",
        ] {
            let score = scorer.score(headline);
            assert!(score < 0.0, "Expected bearish score for '{}', got {}", headline, score);
        }
    }

    #[test]
    fn test_keywords_match_whole_tokens() {
        let scorer = VaderSentimentScorer::new();
        // "crashed" is not the keyword "crash"; "probes" is not "probe"
        assert_eq!(scorer.financial_boost("the crashed probes"), 0.0);
        assert_eq!(scorer.financial_boost("market crash"), -0.5);
    }

    #[test]
    fn test_scores_are_bounded() {
        let scorer = VaderSentimentScorer::new();
        assert_eq!(scorer.score(""), 0.0);
        let extreme = "bankruptcy fraud crash plunge lawsuit downgrade selloff terrible awful";
        assert!(scorer.score(extreme) >= -1.0);
    }

    #[test]
    fn test_article_title_weighted() {
        let scorer = VaderSentimentScorer::new();
        let title_only = scorer.score_article("Shares surge", "");
        assert_eq!(title_only, scorer.score("Shares surge"));
        let mixed = scorer.score_article("Shares surge", "Analysts downgrade the stock");
        let expected = scorer.score("Shares surge") * 0.7
            + scorer.score("Analysts downgrade the stock") * 0.3;
        assert!((mixed - expected).abs() < 1e-12);
    }
}

//! Token estimation and per-model context ceilings
//!
//! Estimates are approximations of the provider tokenizer. Every estimator in
//! this module is deterministic and prefix-monotonic: appending text never
//! lowers the estimate, and non-empty text always costs at least one token.

use once_cell::sync::Lazy;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }
}

/// Character-ratio estimator (~4 characters per token for English prose)
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        // A non-positive ratio would make every estimate infinite
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            4.0
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Number of characters that fit in `tokens`
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count();
        ((chars as f64 / self.chars_per_token).ceil() as usize).max(1)
    }
}

/// Word-based token estimator (fallback, ~1.3 tokens per word)
#[derive(Debug, Clone, Copy)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let word_count = text.split_whitespace().count();
        ((word_count as f64 * self.tokens_per_word).ceil() as usize).max(1)
    }
}

/// Known context ceilings, matched by longest model-id prefix
static DEFAULT_LIMITS: Lazy<Vec<(&'static str, usize)>> = Lazy::new(|| {
    vec![
        ("claude-3-5-sonnet", 200_000),
        ("claude-3-5-haiku", 200_000),
        ("claude-3-7-sonnet", 200_000),
        ("claude-3-opus", 200_000),
        ("claude-3-sonnet", 200_000),
        ("claude-3-haiku", 200_000),
        ("claude-sonnet-4", 200_000),
        ("claude-opus-4", 200_000),
        ("claude-2.1", 200_000),
        ("claude-2.0", 100_000),
        ("claude-instant-1.2", 100_000),
    ]
});

/// Per-model context ceilings
#[derive(Debug, Clone)]
pub struct ModelLimits {
    limits: Vec<(String, usize)>,
}

impl ModelLimits {
    pub fn new(limits: Vec<(String, usize)>) -> Self {
        Self { limits }
    }

    /// Add or replace the ceiling for a model-id prefix
    pub fn with_limit(mut self, prefix: impl Into<String>, limit: usize) -> Self {
        let prefix = prefix.into();
        self.limits.retain(|(p, _)| *p != prefix);
        self.limits.push((prefix, limit));
        self
    }

    /// Ceiling for `model_id`.
    ///
    /// Unrecognized ids get the smallest known ceiling so callers never
    /// overcommit the context window.
    pub fn limit_for(&self, model_id: &str) -> usize {
        self.limits
            .iter()
            .filter(|(prefix, _)| model_id.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, limit)| *limit)
            .unwrap_or_else(|| self.smallest())
    }

    /// Smallest ceiling in the table
    pub fn smallest(&self) -> usize {
        self.limits.iter().map(|(_, l)| *l).min().unwrap_or(0)
    }
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self::new(
            DEFAULT_LIMITS
                .iter()
                .map(|(p, l)| (p.to_string(), *l))
                .collect(),
        )
    }
}

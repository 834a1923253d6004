//! Summarization used to condense text that does not fit the buffer

use crate::api::client::ApiClient;
use crate::error::ContextError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize text segments into a brief of at most `max_tokens`
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError>;
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Summarization request failed: {0}")]
    Request(#[from] ContextError),

    #[error("Summary of {produced} tokens exceeds the {limit} token target")]
    TooLong { produced: usize, limit: usize },
}

impl From<SummarizerError> for ContextError {
    fn from(err: SummarizerError) -> Self {
        match err {
            SummarizerError::TooLong { produced, limit } => ContextError::ContextOverflow {
                needed: produced,
                available: limit,
            },
            SummarizerError::Request(source) => source,
        }
    }
}

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a concise summarizer. Extract key information and compress it efficiently.";

/// Summarizer backed by the provider's messages endpoint
pub struct ApiSummarizer {
    client: Arc<ApiClient>,
    model: Option<String>,
}

impl ApiSummarizer {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client, model: None }
    }

    /// Use a different (usually cheaper) model than the client default
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn build_prompt(texts: &[String], max_tokens: usize) -> String {
        let combined = texts.join("\n\n---\n\n");
        format!(
            "Summarize the following text into a concise brief. \
            Keep key facts, decisions and open items. \
            Keep the summary under {} tokens.\n\n{}",
            max_tokens, combined
        )
    }
}

#[async_trait]
impl Summarizer for ApiSummarizer {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError> {
        if texts.is_empty() {
            return Ok(String::new());
        }

        debug!("Summarizing {} text segments, target: {} tokens", texts.len(), max_tokens);

        let prompt = Self::build_prompt(texts, max_tokens);
        self.client
            .send(&prompt, Some(SUMMARY_SYSTEM_PROMPT), self.model.as_deref())
            .await
            .map_err(|e| {
                warn!("Summarization failed: {}", e);
                SummarizerError::Request(e)
            })
    }
}

/// Offline fallback: keeps the head of the joined text, cut to the target size
pub struct TruncatingSummarizer {
    chars_per_token: f64,
}

impl TruncatingSummarizer {
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            4.0
        };
        Self { chars_per_token }
    }
}

impl Default for TruncatingSummarizer {
    fn default() -> Self {
        Self::new(4.0)
    }
}

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError> {
        let joined = texts.join("\n");
        let max_chars = (max_tokens as f64 * self.chars_per_token).floor() as usize;
        if joined.chars().count() <= max_chars {
            return Ok(joined);
        }
        // Leave room for the ellipsis
        let keep = max_chars.saturating_sub(1);
        let mut brief: String = joined.chars().take(keep).collect();
        if keep > 0 {
            brief.push('…');
        }
        Ok(brief)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::token_estimator::{CharRatioEstimator, TokenEstimator};

    #[tokio::test]
    async fn test_truncating_summarizer_passthrough() {
        let summarizer = TruncatingSummarizer::default();
        let texts = vec!["Hello".to_string(), "World".to_string()];
        let result = summarizer.summarize(&texts, 100).await.unwrap();
        assert_eq!(result, "Hello\nWorld");
    }

    #[tokio::test]
    async fn test_truncating_summarizer_fits_target() {
        let summarizer = TruncatingSummarizer::new(4.0);
        let texts = vec!["x".repeat(1000)];
        let result = summarizer.summarize(&texts, 10).await.unwrap();

        assert!(result.ends_with('…'));
        assert!(CharRatioEstimator::new(4.0).estimate(&result) <= 10);
    }

    #[test]
    fn test_request_error_keeps_its_kind() {
        let err: ContextError =
            SummarizerError::Request(ContextError::RateLimitExceeded("slow down".into())).into();
        assert!(matches!(err, ContextError::RateLimitExceeded(m) if m == "slow down"));
    }

    #[test]
    fn test_too_long_maps_to_overflow() {
        let err: ContextError = SummarizerError::TooLong {
            produced: 50,
            limit: 20,
        }
        .into();
        assert!(matches!(
            err,
            ContextError::ContextOverflow {
                needed: 50,
                available: 20
            }
        ));
    }
}

//! Conversation orchestration
//!
//! Per turn: the user text goes into the buffer, the buffer is rendered into
//! the prompt, the reply comes back from the client and goes into the buffer
//! too. Text that overflows the buffer is condensed by the summarizer (when
//! one is configured) and admitted as a summary item instead.

use crate::api::client::{ApiClient, StreamingCall};
use crate::api::models::StreamingResult;
use crate::config::{BudgetConfig, Config};
use crate::context::buffer::{ContextBuffer, SharedContextBuffer};
use crate::context::models::ContextKind;
use crate::context::summarizer::{Summarizer, SummarizerError};
use crate::context::token_estimator::{CharRatioEstimator, ModelLimits};
use crate::error::{ContextError, Result};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One buffered item as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedItem {
    pub kind: ContextKind,
    pub text: String,
    pub priority: i32,
}

/// Serializable state of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub model: String,
    pub system_prompt: Option<String>,
    /// Oldest first
    pub items: Vec<RecordedItem>,
    pub saved_at: DateTime<Utc>,
}

/// Keyed storage for conversation records
pub trait ConversationStore: Send + Sync {
    fn save(&self, key: &str, record: &ConversationRecord) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<ConversationRecord>>;
    fn delete(&self, key: &str) -> Result<bool>;
}

/// Records held as JSON documents in memory
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    documents: DashMap<String, String>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn save(&self, key: &str, record: &ConversationRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.documents.insert(key.to_string(), json);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<ConversationRecord>> {
        match self.documents.get(key) {
            Some(json) => Ok(Some(serde_json::from_str(json.value())?)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.documents.remove(key).is_some())
    }
}

/// Feeds turns through a shared context buffer and an API client
pub struct ConversationOrchestrator {
    buffer: SharedContextBuffer,
    client: Arc<ApiClient>,
    summarizer: Option<Arc<dyn Summarizer>>,
    model: String,
    system_prompt: Option<String>,
    budget: BudgetConfig,
    metrics: Arc<Metrics>,
}

impl ConversationOrchestrator {
    pub fn new(
        client: Arc<ApiClient>,
        buffer: SharedContextBuffer,
        budget: BudgetConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let model = client.config().default_model.clone();
        Self {
            buffer,
            client,
            summarizer: None,
            model,
            system_prompt: None,
            budget,
            metrics,
        }
    }

    /// Size the buffer from the default model's context limit and the
    /// configured headroom
    pub fn from_config(config: &Config, client: Arc<ApiClient>, metrics: Arc<Metrics>) -> Result<Self> {
        let capacity = ModelLimits::default().limit_for(&config.api.default_model);
        let headroom = &config.budget.headroom;
        headroom.validate(capacity)?;

        let estimator = Arc::new(CharRatioEstimator::new(config.budget.chars_per_token));
        let buffer = SharedContextBuffer::new(ContextBuffer::with_estimator(
            capacity,
            headroom.reserved(),
            estimator,
        ))
        .with_metrics(metrics.clone());

        info!(
            "Conversation buffer: {} tokens for model {} ({} reserved)",
            capacity,
            config.api.default_model,
            headroom.reserved()
        );
        Ok(Self::new(client, buffer, config.budget.clone(), metrics))
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn buffer(&self) -> &SharedContextBuffer {
        &self.buffer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Change the headroom for future additions
    pub fn set_reserved(&self, reserved: usize) {
        self.buffer.set_reserved(reserved);
    }

    /// Run one single-shot turn and return the reply
    pub async fn send_turn(&self, user_text: &str) -> Result<String> {
        let prompt = self.push_user_turn(user_text).await?;
        let reply = self
            .client
            .send(&prompt, self.system_prompt.as_deref(), Some(&self.model))
            .await?;
        self.push_reply(&reply).await?;
        Ok(reply)
    }

    /// Start a streaming turn.
    ///
    /// The reply is not buffered automatically; pass the final result to
    /// [`ConversationOrchestrator::commit_reply`].
    pub async fn send_turn_streaming(&self, user_text: &str) -> Result<StreamingCall> {
        let prompt = self.push_user_turn(user_text).await?;
        self.client
            .send_streaming(&prompt, self.system_prompt.as_deref(), Some(&self.model))
            .await
    }

    /// Buffer a streamed reply.
    ///
    /// Returns `Ok(None)` when there is nothing worth keeping: the stream
    /// failed, was cancelled or produced no text. Truncated replies are kept.
    pub async fn commit_reply(&self, result: &StreamingResult) -> Result<Option<usize>> {
        if result.error.is_some() || result.accumulated_text.is_empty() {
            debug!("Discarding streamed reply (error: {:?})", result.error);
            return Ok(None);
        }
        if result.truncated {
            warn!("Committing truncated reply ({} chars)", result.accumulated_text.len());
        }
        self.push_reply(&result.accumulated_text).await.map(Some)
    }

    /// Add reference material to the buffer
    pub async fn add_document(&self, text: &str) -> Result<usize> {
        self.admit_or_summarize(text, ContextKind::Document, self.budget.document_priority)
            .await
    }

    /// Capture the buffered conversation for persistence
    pub fn snapshot_record(&self) -> ConversationRecord {
        let snapshot = self.buffer.snapshot();
        let mut items = snapshot.items.clone();
        items.sort_by_key(|item| item.inserted_at());
        ConversationRecord {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            items: items
                .into_iter()
                .map(|item| RecordedItem {
                    kind: item.kind().clone(),
                    text: item.text().to_string(),
                    priority: item.priority(),
                })
                .collect(),
            saved_at: Utc::now(),
        }
    }

    /// Replace the buffer contents with a saved record.
    ///
    /// Items are re-admitted oldest first, so a record larger than the
    /// current budget loses its lowest-value items through normal eviction.
    /// If any single item cannot fit, nothing changes.
    pub fn restore(&mut self, record: &ConversationRecord) -> Result<()> {
        self.buffer.replace_all(
            record
                .items
                .iter()
                .map(|item| (item.text.clone(), item.kind.clone(), item.priority)),
        )?;
        self.model = record.model.clone();
        self.system_prompt = record.system_prompt.clone();
        debug!("Restored {} items from record saved at {}", record.items.len(), record.saved_at);
        Ok(())
    }

    pub fn save_to(&self, store: &dyn ConversationStore, key: &str) -> Result<()> {
        store.save(key, &self.snapshot_record())
    }

    /// Restore from `store`; returns false when no record exists under `key`
    pub fn load_from(&mut self, store: &dyn ConversationStore, key: &str) -> Result<bool> {
        match store.load(key)? {
            Some(record) => {
                self.restore(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn push_user_turn(&self, user_text: &str) -> Result<String> {
        self.admit_or_summarize(
            &format!("User: {}", user_text),
            ContextKind::Message,
            self.budget.message_priority,
        )
        .await?;
        Ok(self.buffer.render_structured())
    }

    async fn push_reply(&self, reply: &str) -> Result<usize> {
        self.admit_or_summarize(
            &format!("Assistant: {}", reply),
            ContextKind::Message,
            self.budget.message_priority,
        )
        .await
    }

    async fn admit_or_summarize(&self, text: &str, kind: ContextKind, priority: i32) -> Result<usize> {
        let available = match self.buffer.add(text, kind, priority) {
            Ok(available) => return Ok(available),
            Err(ContextError::ContextOverflow { available, .. }) => available,
            Err(e) => return Err(e),
        };
        let summarizer = match &self.summarizer {
            Some(summarizer) => summarizer,
            None => {
                return Err(ContextError::ContextOverflow {
                    needed: self.buffer.estimate(text),
                    available,
                })
            }
        };

        info!("Text exceeds the {} available tokens, summarizing", available);
        let summary = summarizer.summarize(&[text.to_string()], available).await?;
        let produced = self.buffer.estimate(&summary);
        if produced > available {
            return Err(SummarizerError::TooLong {
                produced,
                limit: available,
            }
            .into());
        }

        let remaining = self
            .buffer
            .add(summary, ContextKind::Summary, self.budget.summary_priority)?;
        self.metrics.summarizations.inc();
        Ok(remaining)
    }
}

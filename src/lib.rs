//! Client-side engine for bounded, multi-turn LLM conversations
//!
//! - [`context`]: token estimation and the capacity-bounded context buffer
//! - [`api`]: authenticated, retrying request pipeline with SSE streaming
//! - [`conversation`]: turn orchestration over both

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod logging;
pub mod metrics;

pub use api::{ApiClient, CallStatus, StreamEvent, StreamingCall, StreamingResult};
pub use config::Config;
pub use context::{ContextBuffer, ContextKind, SharedContextBuffer, TokenEstimator};
pub use conversation::{ConversationOrchestrator, ConversationRecord, ConversationStore, InMemoryConversationStore};
pub use error::{ContextError, ErrorKind, Result};
pub use metrics::Metrics;

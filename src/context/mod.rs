//! Context management with token budget enforcement
//!
//! A [`ContextBuffer`] holds conversation and document material under a
//! token ceiling derived from the model's context window minus the headroom
//! reserved for the system prompt and the reply.

pub mod buffer;
pub mod headroom;
pub mod models;
pub mod summarizer;
pub mod token_estimator;

pub use buffer::{Admission, BufferSnapshot, ContextBuffer, SharedContextBuffer};
pub use headroom::{BudgetError, HeadroomConfig};
pub use models::{ContextItem, ContextKind, ItemId};
pub use summarizer::{ApiSummarizer, Summarizer, SummarizerError, TruncatingSummarizer};
pub use token_estimator::{CharRatioEstimator, ModelLimits, TokenEstimator, WordBasedEstimator};

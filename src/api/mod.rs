//! Request pipeline for the provider's messages API

pub mod auth;
pub mod cache;
pub mod client;
pub mod models;
pub mod retry;
pub mod stream;

pub use auth::{AuthScheme, CredentialStore, EnvCredentialStore, InMemoryCredentialStore, RequestAuthenticator};
pub use cache::{CacheConfig, ResponseCache};
pub use client::{ApiClient, CallStatus, StreamingCall};
pub use models::{ChatMessage, MessageRequest, Role, StreamEvent, StreamingResult};
pub use retry::{RetryAttempt, RetryCause, RetryConfig, RetryDecision, RetryPolicy};
pub use stream::{pump_stream, DecoderState, SseLineBuffer, StreamDecoder};

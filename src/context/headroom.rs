//! Reserved headroom for the system prompt and the expected reply
//!
//! The context window is split into two parts:
//! - Reserved: system/instructions + completion budget, never filled by buffered items
//! - Buffer: everything else, available to conversation turns and documents

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Headroom configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadroomConfig {
    /// Tokens set aside for the system prompt
    #[serde(default = "default_system_tokens")]
    pub system_tokens: usize,

    /// Tokens set aside for the model's reply
    #[serde(default = "default_completion_tokens")]
    pub completion_tokens: usize,
}

fn default_system_tokens() -> usize {
    700
}

fn default_completion_tokens() -> usize {
    1024
}

impl Default for HeadroomConfig {
    fn default() -> Self {
        Self {
            system_tokens: default_system_tokens(),
            completion_tokens: default_completion_tokens(),
        }
    }
}

impl HeadroomConfig {
    /// Total reserved tokens
    pub fn reserved(&self) -> usize {
        self.system_tokens + self.completion_tokens
    }

    /// Validate the reservation against a model's context capacity
    pub fn validate(&self, capacity: usize) -> Result<(), BudgetError> {
        let reserved = self.reserved();
        if reserved >= capacity {
            return Err(BudgetError::ConfigurationInvalid {
                allocated: reserved,
                max: capacity,
            });
        }
        Ok(())
    }

    /// Tokens left for buffered items under `capacity`
    pub fn buffer_budget(&self, capacity: usize) -> Result<usize, BudgetError> {
        self.validate(capacity)?;
        Ok(capacity - self.reserved())
    }
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Configuration invalid: {allocated} tokens reserved, {max} tokens capacity")]
    ConfigurationInvalid { allocated: usize, max: usize },
}

impl From<BudgetError> for crate::error::ContextError {
    fn from(err: BudgetError) -> Self {
        crate::error::ContextError::Configuration(err.to_string())
    }
}

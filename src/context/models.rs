//! Data models for context management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque handle to an item held by a context buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a piece of buffered content is
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Message,
    Document,
    Summary,
    Other(String),
}

impl ContextKind {
    /// Header used when rendering non-message sections
    pub fn section_title(&self) -> String {
        match self {
            ContextKind::Message => "Conversation".to_string(),
            ContextKind::Document => "Documents".to_string(),
            ContextKind::Summary => "Summary".to_string(),
            ContextKind::Other(name) => name.clone(),
        }
    }
}

/// A unit of buffered conversation or document material.
///
/// Items are immutable once admitted; the buffer owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    id: ItemId,
    text: String,
    kind: ContextKind,
    token_count: usize,
    priority: i32,
    /// Monotonic insertion sequence, strictly increasing per buffer
    inserted_at: u64,
    created_at: DateTime<Utc>,
}

impl ContextItem {
    pub(crate) fn new(
        text: String,
        kind: ContextKind,
        token_count: usize,
        priority: i32,
        inserted_at: u64,
    ) -> Self {
        Self {
            id: ItemId::new(),
            text,
            kind,
            token_count,
            priority,
            inserted_at,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn inserted_at(&self) -> u64 {
        self.inserted_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Eviction order key: lowest priority first, oldest first on ties
    pub(crate) fn eviction_key(&self) -> (i32, u64) {
        (self.priority, self.inserted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_key_orders_priority_then_age() {
        let old_low = ContextItem::new("a".into(), ContextKind::Message, 1, 1, 0);
        let new_low = ContextItem::new("b".into(), ContextKind::Message, 1, 1, 1);
        let old_high = ContextItem::new("c".into(), ContextKind::Message, 1, 5, 2);

        let mut items = vec![&old_high, &new_low, &old_low];
        items.sort_by_key(|i| i.eviction_key());
        let order: Vec<&str> = items.iter().map(|i| i.text()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ContextKind::Other("notes".into())).unwrap();
        assert_eq!(json, r#"{"other":"notes"}"#);
        let kind: ContextKind = serde_json::from_str(r#""document""#).unwrap();
        assert_eq!(kind, ContextKind::Document);
    }
}

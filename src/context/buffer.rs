//! Capacity-bounded context buffer with priority/recency eviction
//!
//! The buffer keeps `used_tokens <= capacity - reserved` after every successful
//! `add`. When a new item does not fit, items are evicted greedily in
//! `(priority ascending, inserted_at ascending)` order until the deficit is
//! covered. If the item still does not fit once every candidate is gone, `add`
//! fails with `ContextOverflow` and the evictions that already happened stay
//! in effect (best-effort reclaim).

use super::models::{ContextItem, ContextKind, ItemId};
use super::token_estimator::{CharRatioEstimator, TokenEstimator};
use crate::cache::Cacheable;
use crate::error::{ContextError, Result};
use crate::metrics::Metrics;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Outcome of admitting an item
#[derive(Debug, Clone)]
pub struct Admission {
    pub id: ItemId,
    pub available: usize,
    pub evicted: Vec<ContextItem>,
}

/// Token-bounded collection of context items
pub struct ContextBuffer {
    capacity: usize,
    reserved: usize,
    items: IndexMap<ItemId, ContextItem>,
    used_tokens: usize,
    next_seq: u64,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextBuffer {
    /// Create a buffer using the default character-ratio estimator
    pub fn new(capacity: usize, reserved: usize) -> Self {
        Self::with_estimator(capacity, reserved, Arc::new(CharRatioEstimator::default()))
    }

    pub fn with_estimator(
        capacity: usize,
        reserved: usize,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        Self {
            capacity,
            reserved,
            items: IndexMap::new(),
            used_tokens: 0,
            next_seq: 0,
            estimator,
        }
    }

    /// Add text and return the remaining headroom
    pub fn add(&mut self, text: impl Into<String>, kind: ContextKind, priority: i32) -> Result<usize> {
        self.admit(text, kind, priority).map(|a| a.available)
    }

    /// Add text, reporting the new item's id and anything evicted to make room
    pub fn admit(
        &mut self,
        text: impl Into<String>,
        kind: ContextKind,
        priority: i32,
    ) -> Result<Admission> {
        let text = text.into();
        let cost = self.estimator.estimate(&text);
        let budget = self.budget();

        let mut evicted = Vec::new();
        let deficit = (self.used_tokens + cost).saturating_sub(budget);
        if deficit > 0 {
            evicted = self.evict(deficit);
        }

        let available = budget.saturating_sub(self.used_tokens);
        if cost > available {
            warn!(
                "Context overflow: need {} tokens, have {} (evicted {} items)",
                cost,
                available,
                evicted.len()
            );
            return Err(ContextError::ContextOverflow {
                needed: cost,
                available,
            });
        }

        let item = ContextItem::new(text, kind, cost, priority, self.next_seq);
        self.next_seq += 1;
        let id = item.id();
        self.items.insert(id, item);
        self.used_tokens += cost;

        debug!(
            "Admitted item {} ({} tokens), used {}/{}",
            id, cost, self.used_tokens, budget
        );

        Ok(Admission {
            id,
            available: self.available_tokens(),
            evicted,
        })
    }

    /// Greedily evict until `deficit` tokens are freed or nothing is left
    fn evict(&mut self, deficit: usize) -> Vec<ContextItem> {
        let mut candidates: Vec<((i32, u64), ItemId)> = self
            .items
            .values()
            .map(|item| (item.eviction_key(), item.id()))
            .collect();
        candidates.sort_unstable_by_key(|(key, _)| *key);

        let mut freed = 0;
        let mut evicted = Vec::new();
        for (_, id) in candidates {
            if freed >= deficit {
                break;
            }
            if let Some(item) = self.items.shift_remove(&id) {
                freed += item.token_count();
                self.used_tokens -= item.token_count();
                debug!(
                    "Evicted item {} (priority {}, {} tokens)",
                    id,
                    item.priority(),
                    item.token_count()
                );
                evicted.push(item);
            }
        }
        evicted
    }

    /// Remove a specific item, returning whether it existed
    pub fn remove(&mut self, id: ItemId) -> bool {
        match self.items.shift_remove(&id) {
            Some(item) => {
                self.used_tokens -= item.token_count();
                true
            }
            None => false,
        }
    }

    /// Drop every item
    pub fn clear(&mut self) {
        self.items.clear();
        self.used_tokens = 0;
    }

    /// A buffer with the same limits and estimator holding exactly `items`.
    ///
    /// Items are admitted in order with normal eviction; `self` is untouched.
    pub fn rebuilt<I>(&self, items: I) -> Result<ContextBuffer>
    where
        I: IntoIterator<Item = (String, ContextKind, i32)>,
    {
        let mut fresh = ContextBuffer::with_estimator(self.capacity, self.reserved, self.estimator.clone());
        for (text, kind, priority) in items {
            fresh.add(text, kind, priority)?;
        }
        Ok(fresh)
    }

    /// Change the reserved headroom.
    ///
    /// Existing items are never evicted here; the new reservation applies to
    /// subsequent `add` calls.
    pub fn set_reserved(&mut self, reserved: usize) {
        self.reserved = reserved;
    }

    /// Tokens available for new items
    pub fn available_tokens(&self) -> usize {
        self.budget().saturating_sub(self.used_tokens)
    }

    pub fn used_tokens(&self) -> usize {
        self.used_tokens
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: ItemId) -> Option<&ContextItem> {
        self.items.get(&id)
    }

    /// Items in insertion order
    pub fn items(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.values()
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    /// Render buffered content as prompt text
    pub fn render_structured(&self) -> String {
        render_items(self.items.values())
    }

    /// Immutable copy for concurrent readers
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            capacity: self.capacity,
            reserved: self.reserved,
            used_tokens: self.used_tokens,
            items: self.items.values().cloned().collect(),
        }
    }

    fn budget(&self) -> usize {
        self.capacity.saturating_sub(self.reserved)
    }
}

/// Group items by kind.
///
/// Non-message sections come first under a header, in the order summary,
/// documents, then other kinds by name; conversation messages follow without
/// a header. Every group is ordered by insertion.
fn render_items<'a>(items: impl Iterator<Item = &'a ContextItem>) -> String {
    let mut sections: BTreeMap<&ContextKind, Vec<&ContextItem>> = BTreeMap::new();
    for item in items {
        sections.entry(item.kind()).or_default().push(item);
    }
    for group in sections.values_mut() {
        group.sort_by_key(|item| item.inserted_at());
    }

    let mut order: Vec<&ContextKind> = sections.keys().copied().collect();
    order.sort_by_key(|kind| match kind {
        ContextKind::Summary => 0,
        ContextKind::Document => 1,
        ContextKind::Other(_) => 2,
        ContextKind::Message => 3,
    });

    let mut blocks = Vec::new();
    for kind in order {
        let body = sections[kind]
            .iter()
            .map(|item| item.text())
            .collect::<Vec<_>>()
            .join("\n\n");
        match kind {
            ContextKind::Message => blocks.push(body),
            other => blocks.push(format!("## {}\n\n{}", other.section_title(), body)),
        }
    }
    blocks.join("\n\n")
}

/// Point-in-time view of a buffer
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    pub capacity: usize,
    pub reserved: usize,
    pub used_tokens: usize,
    pub items: Vec<ContextItem>,
}

impl BufferSnapshot {
    pub fn available_tokens(&self) -> usize {
        self.capacity
            .saturating_sub(self.reserved)
            .saturating_sub(self.used_tokens)
    }

    pub fn render_structured(&self) -> String {
        render_items(self.items.iter())
    }
}

/// Buffer handle shared between its owner and concurrent readers.
///
/// Mutations are serialized through a mutex; read-only queries are served from
/// the snapshot published after each mutation, so readers never wait on a writer.
#[derive(Clone)]
pub struct SharedContextBuffer {
    inner: Arc<Mutex<ContextBuffer>>,
    snapshot: Arc<RwLock<Arc<BufferSnapshot>>>,
    metrics: Option<Arc<Metrics>>,
}

impl SharedContextBuffer {
    pub fn new(buffer: ContextBuffer) -> Self {
        let snapshot = Arc::new(buffer.snapshot());
        Self {
            inner: Arc::new(Mutex::new(buffer)),
            snapshot: Arc::new(RwLock::new(snapshot)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self.record_usage(self.used_tokens());
        self
    }

    pub fn add(&self, text: impl Into<String>, kind: ContextKind, priority: i32) -> Result<usize> {
        self.admit(text, kind, priority).map(|a| a.available)
    }

    pub fn admit(
        &self,
        text: impl Into<String>,
        kind: ContextKind,
        priority: i32,
    ) -> Result<Admission> {
        let (result, evicted) = self.mutate(|buffer| {
            let before = buffer.len();
            let result = buffer.admit(text, kind, priority);
            let admitted = usize::from(result.is_ok());
            let evicted = (before + admitted).saturating_sub(buffer.len());
            (result, evicted)
        });
        if let Some(metrics) = &self.metrics {
            metrics.buffer_evictions.inc_by(evicted as f64);
            if matches!(result, Err(ContextError::ContextOverflow { .. })) {
                metrics.buffer_overflows.inc();
            }
        }
        result
    }

    pub fn remove(&self, id: ItemId) -> bool {
        self.mutate(|buffer| buffer.remove(id))
    }

    pub fn clear(&self) {
        self.mutate(|buffer| buffer.clear())
    }

    pub fn set_reserved(&self, reserved: usize) {
        self.mutate(|buffer| buffer.set_reserved(reserved))
    }

    /// Swap in exactly `items`, or leave the contents unchanged on error
    pub fn replace_all<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, ContextKind, i32)>,
    {
        self.mutate(|buffer| {
            *buffer = buffer.rebuilt(items)?;
            Ok(())
        })
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<BufferSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn available_tokens(&self) -> usize {
        self.snapshot().available_tokens()
    }

    pub fn used_tokens(&self) -> usize {
        self.snapshot().used_tokens
    }

    pub fn render_structured(&self) -> String {
        self.snapshot().render_structured()
    }

    /// Estimate with the buffer's own estimator
    pub fn estimate(&self, text: &str) -> usize {
        let buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.estimator().estimate(text)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ContextBuffer) -> T) -> T {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut buffer);
        let snapshot = Arc::new(buffer.snapshot());
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        // Still under the lock, so concurrent writers publish in order
        self.record_usage(buffer.used_tokens());
        out
    }

    fn record_usage(&self, used_tokens: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.buffer_used_tokens.set(used_tokens as i64);
        }
    }
}

impl Cacheable for SharedContextBuffer {
    fn cache_name(&self) -> &str {
        "context_buffer"
    }

    fn cached_entries(&self) -> usize {
        self.snapshot().items.len()
    }

    fn clear_cache(&self) {
        self.clear();
    }
}

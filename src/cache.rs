//! Cache coordination across components
//!
//! Components that hold discardable state implement [`Cacheable`]; a
//! [`CacheCoordinator`] keeps typed handles to them so the whole process can be
//! flushed or inspected in one place.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Capability implemented by components holding clearable cached state
pub trait Cacheable: Send + Sync {
    /// Stable name used in stats and logs
    fn cache_name(&self) -> &str;

    /// Number of entries currently held
    fn cached_entries(&self) -> usize;

    /// Drop all cached state
    fn clear_cache(&self);
}

/// Per-member cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
}

/// Holds the registered cache participants
#[derive(Default, Clone)]
pub struct CacheCoordinator {
    members: Vec<Arc<dyn Cacheable>>,
}

impl CacheCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, member: Arc<dyn Cacheable>) {
        self.members.push(member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Clear every registered member
    pub fn clear_all(&self) {
        for member in &self.members {
            member.clear_cache();
        }
        info!("Cleared {} cache members", self.members.len());
    }

    /// Clear members whose name matches
    pub fn clear(&self, name: &str) -> usize {
        let mut cleared = 0;
        for member in self.members.iter().filter(|m| m.cache_name() == name) {
            member.clear_cache();
            cleared += 1;
        }
        cleared
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        self.members
            .iter()
            .map(|m| CacheStats {
                name: m.cache_name().to_string(),
                entries: m.cached_entries(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        name: &'static str,
        entries: AtomicUsize,
    }

    impl Cacheable for Counter {
        fn cache_name(&self) -> &str {
            self.name
        }

        fn cached_entries(&self) -> usize {
            self.entries.load(Ordering::SeqCst)
        }

        fn clear_cache(&self) {
            self.entries.store(0, Ordering::SeqCst);
        }
    }

    fn counter(name: &'static str, entries: usize) -> Arc<Counter> {
        Arc::new(Counter {
            name,
            entries: AtomicUsize::new(entries),
        })
    }

    #[test]
    fn test_clear_all() {
        let a = counter("a", 3);
        let b = counter("b", 5);
        let mut coordinator = CacheCoordinator::new();
        coordinator.register(a.clone());
        coordinator.register(b.clone());

        assert_eq!(coordinator.len(), 2);
        coordinator.clear_all();
        assert_eq!(a.cached_entries(), 0);
        assert_eq!(b.cached_entries(), 0);
    }

    #[test]
    fn test_clear_by_name_and_stats() {
        let a = counter("a", 3);
        let b = counter("b", 5);
        let mut coordinator = CacheCoordinator::new();
        coordinator.register(a);
        coordinator.register(b);

        assert_eq!(coordinator.clear("b"), 1);
        assert_eq!(coordinator.clear("missing"), 0);
        assert_eq!(
            coordinator.stats(),
            vec![
                CacheStats { name: "a".into(), entries: 3 },
                CacheStats { name: "b".into(), entries: 0 },
            ]
        );
    }
}

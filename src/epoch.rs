use std::sync::atomic::{AtomicU64, Ordering};

/// Generation counter for connection sessions
///
/// Every pairing attempt and every background task captures the epoch that
/// was current when it started. Bumping the epoch (disconnect, cancel, a new
/// attempt) turns every older capture stale, so late timers and callbacks
/// from a superseded attempt can check [`SessionEpoch::is_current`] and bail
/// out without touching shared state.
#[derive(Debug, Default)]
pub struct SessionEpoch {
    generation: AtomicU64,
}

impl SessionEpoch {
    /// Create a counter at generation zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Current generation
    #[must_use]
    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation, invalidating all earlier ones
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// End `generation` if it is still the live one
    ///
    /// Returns `false` when another caller already moved past it, so exactly
    /// one of several racing observers acts on the same event.
    pub fn retire(&self, generation: u64) -> bool {
        self.generation
            .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check if a captured generation is still the live one
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_invalidates_previous() {
        let epoch = SessionEpoch::new();
        let first = epoch.current();
        assert!(epoch.is_current(first));

        let second = epoch.advance();
        assert_eq!(second, first + 1);
        assert!(!epoch.is_current(first));
        assert!(epoch.is_current(second));
    }

    #[test]
    fn test_retire_only_once() {
        let epoch = SessionEpoch::new();
        let generation = epoch.current();

        assert!(epoch.retire(generation));
        assert!(!epoch.retire(generation));
        assert!(!epoch.is_current(generation));
    }
}

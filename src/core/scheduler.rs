//! Rotation scheduler: walks the ordered (plugin, mode, duration) list.
//!
//! **Why**: Rotation is the default display state. Entries advance on static
//! duration expiry or, for dynamic entries, on the plugin's cycle-complete
//! signal — always bounded by a cap so a misbehaving plugin cannot starve
//! the rotation.
//!
//! **Used by**: PriorityResolver (delegated to when no override is active).
//!
//! # Timing model
//!
//! Elapsed-driven, not frame-count-driven: `advance(elapsed)` accumulates
//! wall-clock time per entry, so the achieved tick rate never changes how
//! long an entry stays up.

use std::time::Duration;

use log::{debug, trace};

use crate::plugins::PluginRegistry;

/// How long an entry holds the display.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryDuration {
    Fixed(Duration),
    /// Governed by `is_cycle_complete()`, bounded by `cap`
    Dynamic { cap: Duration },
}

/// One slot of the rotation: plugin, mode, duration policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationEntry {
    pub plugin: String,
    pub mode: String,
    pub duration: EntryDuration,
}

impl RotationEntry {
    pub fn fixed(plugin: &str, mode: &str, secs: u64) -> Self {
        Self {
            plugin: plugin.to_string(),
            mode: mode.to_string(),
            duration: EntryDuration::Fixed(Duration::from_secs(secs)),
        }
    }

    pub fn dynamic(plugin: &str, mode: &str, cap: Duration) -> Self {
        Self {
            plugin: plugin.to_string(),
            mode: mode.to_string(),
            duration: EntryDuration::Dynamic { cap },
        }
    }
}

/// Ordered rotation with a wrap-around cursor.
#[derive(Debug)]
pub struct RotationScheduler {
    entries: Vec<RotationEntry>,
    cursor: usize,
    /// Time accumulated in the current entry
    in_entry: Duration,
}

impl RotationScheduler {
    pub fn new(entries: Vec<RotationEntry>) -> Self {
        Self { entries, cursor: 0, in_entry: Duration::ZERO }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn current(&self) -> Option<&RotationEntry> {
        self.entries.get(self.cursor)
    }

    /// Time spent in the current entry so far.
    pub fn elapsed_in_entry(&self) -> Duration {
        self.in_entry
    }

    /// Remaining time for status reporting; None for dynamic entries that
    /// have not hit their cap.
    pub fn remaining(&self) -> Option<Duration> {
        let entry = self.current()?;
        let limit = match &entry.duration {
            EntryDuration::Fixed(d) => *d,
            EntryDuration::Dynamic { cap } => *cap,
        };
        Some(limit.saturating_sub(self.in_entry))
    }

    /// Accumulate `elapsed` on the current entry and advance past it when it
    /// is done. Returns true when the cursor moved.
    ///
    /// An unhealthy current plugin is advanced past immediately — the entry
    /// stays in the list and is retried once its breaker resets.
    pub fn advance(&mut self, elapsed: Duration, registry: &PluginRegistry) -> bool {
        let Some(entry) = self.entries.get(self.cursor) else {
            return false;
        };
        let plugin_id = entry.plugin.clone();
        let duration = entry.duration.clone();

        if !registry.is_healthy(&plugin_id) {
            debug!("Rotation skipping unhealthy plugin '{}'", plugin_id);
            return self.step_next(registry);
        }

        self.in_entry += elapsed;

        let expired = match duration {
            EntryDuration::Fixed(d) => self.in_entry >= d,
            EntryDuration::Dynamic { cap } => {
                // Cap check first: a plugin that never completes is still
                // advanced past at the bound
                self.in_entry >= cap
                    || registry
                        .get(&plugin_id)
                        .map(|p| p.is_cycle_complete())
                        .unwrap_or(true)
            }
        };

        if expired {
            self.step_next(registry)
        } else {
            false
        }
    }

    /// Advance unconditionally (live-priority exit policy).
    pub fn force_advance(&mut self, registry: &PluginRegistry) -> bool {
        self.step_next(registry)
    }

    /// Replace the entry list (enabled-set change). The in-progress entry is
    /// not disturbed if it survived the rebuild; if it was removed, the
    /// rotation advances immediately to whatever occupies its position now.
    pub fn rebuild(&mut self, entries: Vec<RotationEntry>, registry: &PluginRegistry) {
        let current = self.current().cloned();
        self.entries = entries;

        if self.entries.is_empty() {
            self.cursor = 0;
            self.in_entry = Duration::ZERO;
            return;
        }

        match current.and_then(|c| {
            self.entries
                .iter()
                .position(|e| e.plugin == c.plugin && e.mode == c.mode)
        }) {
            Some(idx) => {
                // Same entry, possibly at a new position: keep its clock
                self.cursor = idx;
            }
            None => {
                debug!("Rotation entry removed mid-pass, advancing immediately");
                self.cursor %= self.entries.len();
                self.in_entry = Duration::ZERO;
                self.enter_current(registry);
            }
        }
    }

    fn step_next(&mut self, registry: &PluginRegistry) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.in_entry = Duration::ZERO;
        self.cursor = (self.cursor + 1) % self.entries.len();

        // Skip entries whose plugin is tripped; bounded to one full lap
        for _ in 0..self.entries.len() {
            let entry = &self.entries[self.cursor];
            if registry.is_healthy(&entry.plugin) {
                break;
            }
            self.cursor = (self.cursor + 1) % self.entries.len();
        }

        self.enter_current(registry);
        trace!(
            "Rotation advanced to [{}] {:?}",
            self.cursor,
            self.current().map(|e| (&e.plugin, &e.mode))
        );
        true
    }

    /// Re-entry hook: dynamic entries get their cycle state cleared so the
    /// plugin starts a fresh pass.
    fn enter_current(&self, registry: &PluginRegistry) {
        if let Some(entry) = self.current() {
            if matches!(entry.duration, EntryDuration::Dynamic { .. }) {
                if let Some(plugin) = registry.get(&entry.plugin) {
                    plugin.reset_cycle_state();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::plugins::{ModeDecl, Plugin, PluginError};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct StubPlugin {
        id: String,
        cycle_complete: AtomicBool,
        resets: AtomicU32,
    }

    impl StubPlugin {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                cycle_complete: AtomicBool::new(false),
                resets: AtomicU32::new(0),
            })
        }
    }

    impl Plugin for StubPlugin {
        fn id(&self) -> &str {
            &self.id
        }
        fn modes(&self) -> Vec<ModeDecl> {
            vec![ModeDecl::fixed("default", Duration::from_secs(5))]
        }
        fn render(&self, _mode: &str, _canvas: &mut Frame) -> Result<(), PluginError> {
            Ok(())
        }
        fn supports_dynamic_duration(&self) -> bool {
            true
        }
        fn is_cycle_complete(&self) -> bool {
            self.cycle_complete.load(Ordering::Relaxed)
        }
        fn reset_cycle_state(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
            self.cycle_complete.store(false, Ordering::Relaxed);
        }
    }

    fn registry_with(plugins: &[Arc<StubPlugin>]) -> PluginRegistry {
        let mut registry = PluginRegistry::new(3);
        for p in plugins {
            registry.register(Arc::clone(p) as Arc<dyn Plugin>);
        }
        registry
    }

    #[test]
    fn test_fixed_duration_advances_on_expiry() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let registry = registry_with(&[a, b]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::fixed("a", "default", 10),
            RotationEntry::fixed("b", "default", 10),
        ]);

        assert!(!sched.advance(Duration::from_secs(4), &registry));
        assert_eq!(sched.current().unwrap().plugin, "a");
        assert!(sched.advance(Duration::from_secs(6), &registry));
        assert_eq!(sched.current().unwrap().plugin, "b");
    }

    #[test]
    fn test_cursor_wraps() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let registry = registry_with(&[a, b]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::fixed("a", "default", 1),
            RotationEntry::fixed("b", "default", 1),
        ]);
        sched.advance(Duration::from_secs(1), &registry);
        sched.advance(Duration::from_secs(1), &registry);
        assert_eq!(sched.current().unwrap().plugin, "a");
    }

    #[test]
    fn test_dynamic_advances_on_cycle_complete() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let registry = registry_with(&[a.clone(), b]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::dynamic("a", "default", Duration::from_secs(60)),
            RotationEntry::fixed("b", "default", 10),
        ]);

        assert!(!sched.advance(Duration::from_secs(1), &registry));
        a.cycle_complete.store(true, Ordering::Relaxed);
        assert!(sched.advance(Duration::from_secs(1), &registry));
        assert_eq!(sched.current().unwrap().plugin, "b");
    }

    #[test]
    fn test_dynamic_bounded_by_cap() {
        // is_cycle_complete never returns true; cap still advances past
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let registry = registry_with(&[a, b]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::dynamic("a", "default", Duration::from_secs(30)),
            RotationEntry::fixed("b", "default", 10),
        ]);

        assert!(!sched.advance(Duration::from_secs(29), &registry));
        assert!(sched.advance(Duration::from_secs(1), &registry));
        assert_eq!(sched.current().unwrap().plugin, "b");
    }

    #[test]
    fn test_reset_cycle_on_reentry() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let registry = registry_with(&[a.clone(), b]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::dynamic("a", "default", Duration::from_secs(60)),
            RotationEntry::fixed("b", "default", 1),
        ]);

        a.cycle_complete.store(true, Ordering::Relaxed);
        sched.advance(Duration::from_secs(1), &registry); // a -> b
        assert_eq!(a.resets.load(Ordering::Relaxed), 0);
        sched.advance(Duration::from_secs(1), &registry); // b -> a, re-entry resets
        assert_eq!(sched.current().unwrap().plugin, "a");
        assert_eq!(a.resets.load(Ordering::Relaxed), 1);
        assert!(!a.is_cycle_complete());
    }

    #[test]
    fn test_rebuild_keeps_in_progress_entry() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let c = StubPlugin::new("c");
        let registry = registry_with(&[a, b, c]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::fixed("a", "default", 10),
            RotationEntry::fixed("b", "default", 10),
        ]);
        sched.advance(Duration::from_secs(10), &registry); // now on b
        sched.advance(Duration::from_secs(3), &registry); // 3s into b

        sched.rebuild(
            vec![
                RotationEntry::fixed("c", "default", 10),
                RotationEntry::fixed("b", "default", 10),
                RotationEntry::fixed("a", "default", 10),
            ],
            &registry,
        );
        // b survived at a new index; its clock is preserved
        assert_eq!(sched.current().unwrap().plugin, "b");
        assert_eq!(sched.elapsed_in_entry(), Duration::from_secs(3));
    }

    #[test]
    fn test_rebuild_advances_when_current_removed() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let c = StubPlugin::new("c");
        let registry = registry_with(&[a, b, c]);
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::fixed("a", "default", 10),
            RotationEntry::fixed("b", "default", 10),
        ]);
        sched.advance(Duration::from_secs(10), &registry); // now on b
        sched.rebuild(
            vec![
                RotationEntry::fixed("a", "default", 10),
                RotationEntry::fixed("c", "default", 10),
            ],
            &registry,
        );
        assert_eq!(sched.current().unwrap().plugin, "c");
        assert_eq!(sched.elapsed_in_entry(), Duration::ZERO);
    }

    #[test]
    fn test_unhealthy_plugin_skipped() {
        let a = StubPlugin::new("a");
        let b = StubPlugin::new("b");
        let c = StubPlugin::new("c");
        let registry = registry_with(&[a, b.clone(), c]);
        for _ in 0..3 {
            registry.record_failure("b");
        }
        let mut sched = RotationScheduler::new(vec![
            RotationEntry::fixed("a", "default", 1),
            RotationEntry::fixed("b", "default", 1),
            RotationEntry::fixed("c", "default", 1),
        ]);
        sched.advance(Duration::from_secs(1), &registry);
        // b is tripped, rotation lands on c
        assert_eq!(sched.current().unwrap().plugin, "c");
    }
}

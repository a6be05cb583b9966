//! Priority resolver: the state machine deciding what renders now.
//!
//! **Why**: Three sources compete for the display — operator on-demand
//! overrides, plugins with live content, and the default rotation. Exactly
//! one governs at any tick, consulted in that strict order. Transitions are
//! total functions of (current state, event); there is never a tick without
//! an authoritative selection while any plugin is enabled.
//!
//! **Used by**: Engine (once per tick); MailboxAdapter events land here.
//!
//! # Transition policy
//!
//! - On-demand expiry is computed lazily per tick (`now >= expires_at`);
//!   pinned overrides never expire.
//! - A `start` always preempts immediately; a second `start` before the
//!   first resolves overwrites the whole state in one assignment, so no tick
//!   ever observes a half-applied target.
//! - Popping an override falls back to the highest-priority state still
//!   valid: live priority if any plugin still reports live, else rotation.
//! - The rotation clock keeps accruing during overrides, so a slot whose
//!   duration ran out underneath an override is gone when the override ends.
//! - Leaving live priority resumes rotation at the entry AFTER the one that
//!   was interrupted (policy choice, recorded in DESIGN.md).

use std::time::{Duration, Instant};

use log::{debug, info};
use uuid::Uuid;

use crate::core::scheduler::RotationScheduler;
use crate::plugins::{ModeDecl, PluginRegistry};

/// Which priority tier produced the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    Rotation,
    LivePriority,
    OnDemand,
}

/// The (plugin, mode) to render this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub plugin: String,
    pub mode: String,
    pub source: SelectionSource,
}

/// Sole authority for "what renders now".
#[derive(Debug, Clone, PartialEq)]
pub enum PriorityState {
    Rotation,
    LivePriority {
        cursor: usize,
    },
    OnDemand {
        plugin: String,
        mode: String,
        expires_at: Option<Instant>,
        pinned: bool,
        request_id: Uuid,
    },
}

/// A validated `start` command (mailbox adapter output).
#[derive(Debug, Clone)]
pub struct StartOverride {
    pub request_id: Uuid,
    pub plugin: String,
    /// None = plugin's default mode
    pub mode: Option<String>,
    /// None = mode's default duration; ZERO = until stopped
    pub duration: Option<Duration>,
    pub pinned: bool,
}

/// Rejection reasons for on-demand starts. Surfaced only through the
/// published status record, never raised into the render loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverError {
    UnknownPlugin(String),
    UnknownMode(String, String),
}

impl std::fmt::Display for ResolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolverError::UnknownPlugin(p) => write!(f, "unknown plugin '{}'", p),
            ResolverError::UnknownMode(p, m) => {
                write!(f, "plugin '{}' has no mode '{}'", p, m)
            }
        }
    }
}

impl std::error::Error for ResolverError {}

/// One live round-robin slot.
#[derive(Debug, Clone)]
struct LiveSlot {
    plugin: String,
    mode: ModeDecl,
}

pub struct PriorityResolver {
    state: PriorityState,
    rotation: RotationScheduler,

    // Live status is a capability query cached per poll cycle, not read
    // every tick
    live_slots: Vec<LiveSlot>,
    live_elapsed: Duration,
    live_poll_interval: Duration,
    last_live_poll: Option<Instant>,

    /// Rotation entry on screen when live priority took over
    interrupted: Option<(String, String)>,
}

impl PriorityResolver {
    pub fn new(rotation: RotationScheduler, live_poll_interval: Duration) -> Self {
        Self {
            state: PriorityState::Rotation,
            rotation,
            live_slots: Vec::new(),
            live_elapsed: Duration::ZERO,
            live_poll_interval,
            last_live_poll: None,
            interrupted: None,
        }
    }

    pub fn state(&self) -> &PriorityState {
        &self.state
    }

    pub fn rotation(&self) -> &RotationScheduler {
        &self.rotation
    }

    pub fn rotation_mut(&mut self) -> &mut RotationScheduler {
        &mut self.rotation
    }

    /// Remaining time of the governing state, for status reporting.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            PriorityState::OnDemand { expires_at, .. } => {
                expires_at.map(|t| t.saturating_duration_since(now))
            }
            PriorityState::LivePriority { cursor } => self
                .live_slots
                .get(*cursor)
                .map(|s| s.mode.duration.saturating_sub(self.live_elapsed)),
            PriorityState::Rotation => self.rotation.remaining(),
        }
    }

    /// Resolve the selection for this tick. Returns None only when nothing
    /// is enabled (idle display).
    pub fn tick(
        &mut self,
        now: Instant,
        elapsed: Duration,
        registry: &PluginRegistry,
    ) -> Option<Selection> {
        self.refresh_live(now, registry);

        // Rotation time accrues regardless of who is on screen
        self.rotation.advance(elapsed, registry);

        // 1. On-demand wins while valid
        if let PriorityState::OnDemand { plugin, mode, expires_at, pinned, .. } = &self.state {
            let expired = !pinned && expires_at.map(|t| now >= t).unwrap_or(false);
            let gone = !registry.contains(plugin);
            if !expired && !gone {
                return Some(Selection {
                    plugin: plugin.clone(),
                    mode: mode.clone(),
                    source: SelectionSource::OnDemand,
                });
            }
            if expired {
                info!("On-demand override expired, falling back");
            } else {
                debug!("On-demand target '{}' vanished, falling back", plugin);
            }
            self.state = PriorityState::Rotation;
        }

        // 2. Live priority
        if !self.live_slots.is_empty() {
            return Some(self.tick_live(elapsed, registry));
        }
        self.exit_live_if_needed(registry);

        // 3. Rotation
        self.rotation.current().map(|entry| Selection {
            plugin: entry.plugin.clone(),
            mode: entry.mode.clone(),
            source: SelectionSource::Rotation,
        })
    }

    /// Apply a validated start command. A fresh start preempts whatever is
    /// active; the whole state is replaced in one assignment.
    pub fn start_override(
        &mut self,
        cmd: StartOverride,
        now: Instant,
        registry: &PluginRegistry,
    ) -> Result<(), ResolverError> {
        if !registry.contains(&cmd.plugin) {
            return Err(ResolverError::UnknownPlugin(cmd.plugin));
        }
        let mode = match cmd.mode {
            Some(m) => registry
                .mode_decl(&cmd.plugin, &m)
                .ok_or_else(|| ResolverError::UnknownMode(cmd.plugin.clone(), m))?,
            None => registry
                .default_mode(&cmd.plugin)
                .ok_or_else(|| ResolverError::UnknownMode(cmd.plugin.clone(), "<default>".into()))?,
        };

        let expires_at = if cmd.pinned {
            None
        } else {
            match cmd.duration {
                Some(d) if d.is_zero() => None, // until stopped
                Some(d) => Some(now + d),
                None => Some(now + mode.duration),
            }
        };

        info!(
            "On-demand start: {}/{} (pinned={}, expires={:?}, request={})",
            cmd.plugin,
            mode.name,
            cmd.pinned,
            expires_at.map(|t| t.saturating_duration_since(now)),
            cmd.request_id
        );

        self.state = PriorityState::OnDemand {
            plugin: cmd.plugin,
            mode: mode.name,
            expires_at,
            pinned: cmd.pinned,
            request_id: cmd.request_id,
        };
        Ok(())
    }

    /// Clear an active override. Fallback to live/rotation happens at the
    /// next tick boundary. Returns true when something was cleared.
    pub fn stop_override(&mut self) -> bool {
        if matches!(self.state, PriorityState::OnDemand { .. }) {
            info!("On-demand override stopped");
            self.state = PriorityState::Rotation;
            true
        } else {
            false
        }
    }

    fn refresh_live(&mut self, now: Instant, registry: &PluginRegistry) {
        let due = self
            .last_live_poll
            .map(|t| now.saturating_duration_since(t) >= self.live_poll_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_live_poll = Some(now);

        self.live_slots = registry
            .live_plugins()
            .into_iter()
            .flat_map(|(plugin, modes)| {
                modes
                    .into_iter()
                    .map(move |mode| LiveSlot { plugin: plugin.clone(), mode })
            })
            .collect();

        // Keep the round-robin cursor valid if the live set shrank
        if let PriorityState::LivePriority { cursor } = &mut self.state {
            if *cursor >= self.live_slots.len() {
                *cursor = 0;
            }
        }
    }

    fn tick_live(&mut self, elapsed: Duration, registry: &PluginRegistry) -> Selection {
        let mut cursor = match self.state {
            PriorityState::LivePriority { cursor } => {
                self.live_elapsed += elapsed;
                cursor
            }
            _ => {
                // Entering live: remember the interrupted rotation entry so
                // rotation resumes past it later
                self.interrupted = self
                    .rotation
                    .current()
                    .map(|e| (e.plugin.clone(), e.mode.clone()));
                info!("Live priority takeover ({} slot(s))", self.live_slots.len());
                self.live_elapsed = Duration::ZERO;
                0
            }
        };
        if cursor >= self.live_slots.len() {
            cursor = 0;
        }

        // Same duration rules as rotation: fixed expiry, or dynamic cycle
        // completion bounded by the declared duration
        let slot = &self.live_slots[cursor];
        let done = if slot.mode.dynamic {
            self.live_elapsed >= slot.mode.duration
                || registry
                    .get(&slot.plugin)
                    .map(|p| p.is_cycle_complete())
                    .unwrap_or(true)
        } else {
            self.live_elapsed >= slot.mode.duration
        };

        if done && self.live_slots.len() > 1 {
            cursor = (cursor + 1) % self.live_slots.len();
            self.live_elapsed = Duration::ZERO;
            let next = &self.live_slots[cursor];
            if next.mode.dynamic {
                if let Some(plugin) = registry.get(&next.plugin) {
                    plugin.reset_cycle_state();
                }
            }
        } else if done {
            self.live_elapsed = Duration::ZERO;
        }

        self.state = PriorityState::LivePriority { cursor };
        let slot = &self.live_slots[cursor];
        Selection {
            plugin: slot.plugin.clone(),
            mode: slot.mode.name.clone(),
            source: SelectionSource::LivePriority,
        }
    }

    fn exit_live_if_needed(&mut self, registry: &PluginRegistry) {
        if !matches!(self.state, PriorityState::LivePriority { .. }) {
            return;
        }
        info!("Live priority ended, resuming rotation");
        // Resume past the interrupted entry unless rotation already moved on
        if let Some((plugin, mode)) = self.interrupted.take() {
            if self
                .rotation
                .current()
                .map(|e| e.plugin == plugin && e.mode == mode)
                .unwrap_or(false)
            {
                self.rotation.force_advance(registry);
            }
        }
        self.state = PriorityState::Rotation;
        self.live_elapsed = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::RotationEntry;
    use crate::frame::Frame;
    use crate::plugins::{Plugin, PluginError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestPlugin {
        id: String,
        live: AtomicBool,
        live_mode_names: Vec<String>,
    }

    impl TestPlugin {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                live: AtomicBool::new(false),
                live_mode_names: Vec::new(),
            })
        }

        fn with_live_modes(id: &str, modes: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                live: AtomicBool::new(false),
                live_mode_names: modes.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    impl Plugin for TestPlugin {
        fn id(&self) -> &str {
            &self.id
        }
        fn modes(&self) -> Vec<ModeDecl> {
            vec![
                ModeDecl::fixed("default", Duration::from_secs(30)),
                ModeDecl::fixed("live", Duration::from_secs(20)),
            ]
        }
        fn render(&self, _mode: &str, _canvas: &mut Frame) -> Result<(), PluginError> {
            Ok(())
        }
        fn has_live_content(&self) -> bool {
            self.live.load(Ordering::Relaxed)
        }
        fn live_modes(&self) -> Vec<String> {
            self.live_mode_names.clone()
        }
    }

    fn registry_with(plugins: &[Arc<TestPlugin>]) -> PluginRegistry {
        let mut registry = PluginRegistry::new(3);
        for p in plugins {
            registry.register(Arc::clone(p) as Arc<dyn Plugin>);
        }
        registry
    }

    fn rotation_of(ids: &[&str]) -> RotationScheduler {
        RotationScheduler::new(
            ids.iter()
                .map(|id| RotationEntry::fixed(id, "default", 30))
                .collect(),
        )
    }

    fn start(plugin: &str, duration_secs: Option<u64>, pinned: bool) -> StartOverride {
        StartOverride {
            request_id: Uuid::new_v4(),
            plugin: plugin.to_string(),
            mode: None,
            duration: duration_secs.map(Duration::from_secs),
            pinned,
        }
    }

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn test_rotation_governs_by_default() {
        let a = TestPlugin::new("a");
        let b = TestPlugin::new("b");
        let registry = registry_with(&[a, b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["a", "b"]), Duration::from_secs(1));

        let sel = resolver.tick(Instant::now(), TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "a");
        assert_eq!(sel.source, SelectionSource::Rotation);
    }

    #[test]
    fn test_on_demand_wins_over_live_and_rotation() {
        let a = TestPlugin::new("a");
        let b = TestPlugin::new("b");
        b.live.store(true, Ordering::Relaxed);
        let registry = registry_with(&[a, b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["a", "b"]), Duration::from_secs(1));

        let t0 = Instant::now();
        resolver.start_override(start("a", Some(10), false), t0, &registry).unwrap();

        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "a");
        assert_eq!(sel.source, SelectionSource::OnDemand);
    }

    #[test]
    fn test_expiry_reverts_without_stop() {
        let a = TestPlugin::new("a");
        let b = TestPlugin::new("b");
        let registry = registry_with(&[a, b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["b", "a"]), Duration::from_secs(1));

        let t0 = Instant::now();
        resolver.start_override(start("a", Some(10), false), t0, &registry).unwrap();

        let sel = resolver.tick(t0 + Duration::from_secs(9), TICK, &registry).unwrap();
        assert_eq!(sel.source, SelectionSource::OnDemand);

        // At t0+10 the override expires lazily, no stop command involved
        let sel = resolver.tick(t0 + Duration::from_secs(10), TICK, &registry).unwrap();
        assert_eq!(sel.source, SelectionSource::Rotation);
        assert_eq!(sel.plugin, "b");
    }

    #[test]
    fn test_pinned_never_expires() {
        let a = TestPlugin::new("a");
        let registry = registry_with(&[a]);
        let mut resolver = PriorityResolver::new(rotation_of(&["a"]), Duration::from_secs(1));

        let t0 = Instant::now();
        resolver.start_override(start("a", Some(10), true), t0, &registry).unwrap();

        let sel = resolver
            .tick(t0 + Duration::from_secs(3600), TICK, &registry)
            .unwrap();
        assert_eq!(sel.source, SelectionSource::OnDemand);
    }

    #[test]
    fn test_duration_zero_means_until_stopped() {
        let a = TestPlugin::new("a");
        let b = TestPlugin::new("b");
        let registry = registry_with(&[a, b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["b"]), Duration::from_secs(1));

        let t0 = Instant::now();
        resolver.start_override(start("a", Some(0), false), t0, &registry).unwrap();

        let sel = resolver
            .tick(t0 + Duration::from_secs(3600), TICK, &registry)
            .unwrap();
        assert_eq!(sel.source, SelectionSource::OnDemand);

        resolver.stop_override();
        let sel = resolver
            .tick(t0 + Duration::from_secs(3601), TICK, &registry)
            .unwrap();
        assert_eq!(sel.source, SelectionSource::Rotation);
    }

    #[test]
    fn test_second_start_overwrites_first() {
        // Scenario C: two starts applied in one batch, only the last renders
        let x = TestPlugin::new("x");
        let y = TestPlugin::new("y");
        let b = TestPlugin::new("b");
        let registry = registry_with(&[x, y, b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["b"]), Duration::from_secs(1));

        let t0 = Instant::now();
        resolver.start_override(start("x", Some(10), false), t0, &registry).unwrap();
        resolver.start_override(start("y", Some(10), false), t0, &registry).unwrap();

        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "y");
    }

    #[test]
    fn test_unknown_plugin_rejected_state_unchanged() {
        let b = TestPlugin::new("b");
        let registry = registry_with(&[b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["b"]), Duration::from_secs(1));

        let t0 = Instant::now();
        let err = resolver
            .start_override(start("ghost", Some(10), false), t0, &registry)
            .unwrap_err();
        assert_eq!(err, ResolverError::UnknownPlugin("ghost".into()));

        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "b");
        assert_eq!(sel.source, SelectionSource::Rotation);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let b = TestPlugin::new("b");
        let registry = registry_with(&[b]);
        let mut resolver = PriorityResolver::new(rotation_of(&["b"]), Duration::from_secs(1));

        let cmd = StartOverride {
            request_id: Uuid::new_v4(),
            plugin: "b".into(),
            mode: Some("nope".into()),
            duration: None,
            pinned: false,
        };
        let err = resolver
            .start_override(cmd, Instant::now(), &registry)
            .unwrap_err();
        assert!(matches!(err, ResolverError::UnknownMode(_, _)));
    }

    #[test]
    fn test_scenario_a_returns_to_interrupted_slot() {
        // Rotation on B (30s slots); start A for 10s; back to B afterwards
        let a = TestPlugin::new("a");
        let b = TestPlugin::new("b");
        let c = TestPlugin::new("c");
        let registry = registry_with(&[a, b, c]);
        let mut resolver = PriorityResolver::new(rotation_of(&["b", "c"]), Duration::from_secs(1));

        let t0 = Instant::now();
        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "b");

        resolver.start_override(start("a", Some(10), false), t0, &registry).unwrap();
        let sel = resolver.tick(t0 + TICK, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "a");

        // 10s later: override expired, B's 30s slot has not, so B is back
        let sel = resolver
            .tick(t0 + Duration::from_secs(10), Duration::from_secs(10), &registry)
            .unwrap();
        assert_eq!(sel.plugin, "b");
        assert_eq!(sel.source, SelectionSource::Rotation);
    }

    #[test]
    fn test_scenario_a_advances_when_slot_also_elapsed() {
        // B only holds a 5s slot: by the time the 10s override ends, the
        // rotation clock has moved on to C
        let a = TestPlugin::new("a");
        let b = TestPlugin::new("b");
        let c = TestPlugin::new("c");
        let registry = registry_with(&[a, b, c]);
        let rotation = RotationScheduler::new(vec![
            RotationEntry::fixed("b", "default", 5),
            RotationEntry::fixed("c", "default", 30),
        ]);
        let mut resolver = PriorityResolver::new(rotation, Duration::from_secs(1));

        let t0 = Instant::now();
        resolver.tick(t0, TICK, &registry);
        resolver.start_override(start("a", Some(10), false), t0, &registry).unwrap();

        let sel = resolver
            .tick(t0 + Duration::from_secs(10), Duration::from_secs(10), &registry)
            .unwrap();
        assert_eq!(sel.plugin, "c");
    }

    #[test]
    fn test_scenario_b_live_takeover_and_resume_past() {
        // Rotation shows D; C flips live; on flip-back rotation resumes at
        // D's next entry, not D
        let c = TestPlugin::with_live_modes("c", &["live"]);
        let d = TestPlugin::new("d");
        let e = TestPlugin::new("e");
        let registry = registry_with(&[c.clone(), d, e]);
        let mut resolver =
            PriorityResolver::new(rotation_of(&["d", "e"]), Duration::from_millis(0));

        let t0 = Instant::now();
        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "d");

        c.live.store(true, Ordering::Relaxed);
        let sel = resolver.tick(t0 + TICK, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "c");
        assert_eq!(sel.mode, "live");
        assert_eq!(sel.source, SelectionSource::LivePriority);

        c.live.store(false, Ordering::Relaxed);
        let sel = resolver.tick(t0 + TICK * 2, TICK, &registry).unwrap();
        assert_eq!(sel.source, SelectionSource::Rotation);
        assert_eq!(sel.plugin, "e");
    }

    #[test]
    fn test_live_round_robin_multiple_plugins() {
        let c = TestPlugin::with_live_modes("c", &["live"]);
        let d = TestPlugin::with_live_modes("d", &["live"]);
        let registry = registry_with(&[c.clone(), d.clone()]);
        let mut resolver =
            PriorityResolver::new(rotation_of(&["c", "d"]), Duration::from_millis(0));

        c.live.store(true, Ordering::Relaxed);
        d.live.store(true, Ordering::Relaxed);

        let t0 = Instant::now();
        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.plugin, "c");

        // "live" mode holds for 20s; after that the robin moves to d
        let sel = resolver
            .tick(t0 + Duration::from_secs(20), Duration::from_secs(20), &registry)
            .unwrap();
        assert_eq!(sel.plugin, "d");
        assert_eq!(sel.source, SelectionSource::LivePriority);
    }

    #[test]
    fn test_pop_falls_back_to_live_when_still_live() {
        let a = TestPlugin::new("a");
        let c = TestPlugin::with_live_modes("c", &["live"]);
        let registry = registry_with(&[a, c.clone()]);
        let mut resolver =
            PriorityResolver::new(rotation_of(&["a"]), Duration::from_millis(0));

        c.live.store(true, Ordering::Relaxed);
        let t0 = Instant::now();
        resolver.start_override(start("a", Some(5), false), t0, &registry).unwrap();
        let sel = resolver.tick(t0, TICK, &registry).unwrap();
        assert_eq!(sel.source, SelectionSource::OnDemand);

        // Override expires while c is still live: pop lands on live, not
        // rotation
        let sel = resolver
            .tick(t0 + Duration::from_secs(5), Duration::from_secs(5), &registry)
            .unwrap();
        assert_eq!(sel.plugin, "c");
        assert_eq!(sel.source, SelectionSource::LivePriority);
    }
}

//! Ordered plugin registry with a per-plugin failure circuit breaker.
//!
//! **Why**: Every plugin call the core makes goes through the checked
//! wrappers here, so a throwing plugin degrades to "no content" instead of
//! taking the render loop down. Repeated failures trip the breaker and the
//! plugin drops out of rotation/live/Vegas until externally reset.
//!
//! **Used by**: Engine, Resolver, RotationScheduler, VegasCompositor.
//!
//! Registration order is display order (insertion order preserved). The
//! plugin set is fixed for the process lifetime; only health state mutates,
//! behind atomics so the registry is shared as `Arc<PluginRegistry>` without
//! locks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::frame::Frame;
use crate::plugins::{ModeDecl, Plugin, Segment};

/// Default breaker threshold when settings leave it unset.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

struct PluginSlot {
    plugin: Arc<dyn Plugin>,
    consecutive_failures: AtomicU32,
    unhealthy: AtomicBool,
}

/// Ordered registry of content sources.
pub struct PluginRegistry {
    slots: IndexMap<String, PluginSlot>,
    failure_threshold: u32,
}

impl PluginRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            slots: IndexMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Register a plugin. Re-registering an id replaces the previous entry
    /// and keeps its position.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let id = plugin.id().to_string();
        info!("Registered plugin '{}' ({} modes)", id, plugin.modes().len());
        self.slots.insert(
            id,
            PluginSlot {
                plugin,
                consecutive_failures: AtomicU32::new(0),
                unhealthy: AtomicBool::new(false),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.slots.get(id).map(|s| Arc::clone(&s.plugin))
    }

    /// Plugin ids in registration (= display) order.
    pub fn ids(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// Declared mode by name.
    pub fn mode_decl(&self, id: &str, mode: &str) -> Option<ModeDecl> {
        self.get(id)?.modes().into_iter().find(|m| m.name == mode)
    }

    /// First declared mode (the plugin's default).
    pub fn default_mode(&self, id: &str) -> Option<ModeDecl> {
        self.get(id)?.modes().into_iter().next()
    }

    // === Health / circuit breaker ===

    pub fn is_healthy(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .map(|s| !s.unhealthy.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Clear failure state (external reset of the breaker).
    pub fn reset_health(&self, id: &str) {
        if let Some(slot) = self.slots.get(id) {
            slot.consecutive_failures.store(0, Ordering::Relaxed);
            if slot.unhealthy.swap(false, Ordering::Relaxed) {
                info!("Plugin '{}' health reset, back in rotation", id);
            }
        }
    }

    pub fn record_success(&self, id: &str) {
        if let Some(slot) = self.slots.get(id) {
            slot.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, id: &str) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        let failures = slot.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold && !slot.unhealthy.swap(true, Ordering::Relaxed) {
            warn!(
                "Plugin '{}' marked unhealthy after {} consecutive failures",
                id, failures
            );
        }
    }

    // === Checked call wrappers ===

    /// Render `mode` into a fresh canvas. Errors are logged and counted,
    /// returning None ("no content this tick").
    pub fn render_checked(&self, id: &str, mode: &str, width: u32, height: u32) -> Option<Frame> {
        let plugin = self.get(id)?;
        let mut canvas = Frame::new(width, height);
        match plugin.render(mode, &mut canvas) {
            Ok(()) => {
                self.record_success(id);
                Some(canvas)
            }
            Err(e) => {
                debug!("Plugin '{}' render({}) failed: {}", id, mode, e);
                self.record_failure(id);
                None
            }
        }
    }

    /// Run a plugin's slow update. Called from the worker pool.
    pub fn update_checked(&self, id: &str) {
        let Some(plugin) = self.get(id) else {
            return;
        };
        match plugin.update() {
            Ok(()) => self.record_success(id),
            Err(e) => {
                warn!("Plugin '{}' update failed: {}", id, e);
                self.record_failure(id);
            }
        }
    }

    /// Current Vegas segments, or None when the plugin declares none.
    pub fn vegas_segments_checked(&self, id: &str) -> Option<Vec<Segment>> {
        let plugin = self.get(id)?;
        plugin.vegas_content().filter(|segs| !segs.is_empty())
    }

    /// Healthy plugins currently reporting live content, with the modes the
    /// resolver may pick from (declared live modes, else all modes).
    pub fn live_plugins(&self) -> Vec<(String, Vec<ModeDecl>)> {
        let mut live = Vec::new();
        for (id, slot) in &self.slots {
            if slot.unhealthy.load(Ordering::Relaxed) || !slot.plugin.has_live_content() {
                continue;
            }
            let declared = slot.plugin.live_modes();
            let modes: Vec<ModeDecl> = if declared.is_empty() {
                slot.plugin.modes()
            } else {
                slot.plugin
                    .modes()
                    .into_iter()
                    .filter(|m| declared.contains(&m.name))
                    .collect()
            };
            if !modes.is_empty() {
                live.push((id.clone(), modes));
            }
        }
        live
    }

    /// Effective dynamic-duration cap: config override wins, else the plugin
    /// declaration, else the global cap.
    pub fn dynamic_cap(&self, id: &str, config_override: Option<Duration>, global: Duration) -> Duration {
        config_override
            .or_else(|| self.get(id).and_then(|p| p.dynamic_cap()))
            .unwrap_or(global)
    }
}

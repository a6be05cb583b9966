//! Plugin capability contract.
//!
//! Every content source implements [`Plugin`]. The required surface is tiny
//! (identity, declared modes, render); everything else — live content,
//! dynamic duration, Vegas segments — has a default no-op implementation so
//! plugins opt into more without an inheritance hierarchy.
//!
//! The core only ever calls these methods through the registry's checked
//! wrappers; a plugin error is logged and treated as "no content this tick",
//! it never reaches the render loop.
//!
//! # Threading
//!
//! `render()` and the capability queries run on the render tick and must only
//! read pre-computed state. `update()` is the slow path (network fetch,
//! parsing) and runs on the background worker pool; plugins use interior
//! mutability to publish refreshed snapshots.

pub mod builtin;
pub mod registry;

pub use registry::PluginRegistry;

use std::time::Duration;

use crate::frame::Frame;

/// Plugin call failures. Caught at the registry boundary, never propagated
/// into the render loop.
#[derive(Debug)]
pub enum PluginError {
    /// Nothing to show for this mode right now (not an error condition)
    NoContent,
    Render(String),
    Update(String),
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginError::NoContent => write!(f, "no content"),
            PluginError::Render(e) => write!(f, "render error: {}", e),
            PluginError::Update(e) => write!(f, "update error: {}", e),
        }
    }
}

impl std::error::Error for PluginError {}

/// A display mode a plugin declares: name, default rotation duration and
/// whether the duration is governed by the plugin's cycle signal instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeDecl {
    pub name: String,
    pub duration: Duration,
    pub dynamic: bool,
}

impl ModeDecl {
    pub fn fixed(name: &str, duration: Duration) -> Self {
        Self { name: name.to_string(), duration, dynamic: false }
    }

    pub fn dynamic(name: &str, cap_hint: Duration) -> Self {
        Self { name: name.to_string(), duration: cap_hint, dynamic: true }
    }
}

/// Segment behavior inside the Vegas strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Images appended end-to-end, scrolls with the strip
    Scroll,
    /// Occupies a declared width of strip space, rides the strip
    FixedSegment,
    /// Halts the strip on arrival and renders full-frame for a dwell time
    Static,
}

/// A plugin's contribution to the Vegas composite strip.
///
/// Regenerated by the owning plugin on its own cadence; the compositor holds
/// it only for the current tick and tolerates stale or absent segments.
#[derive(Debug, Clone)]
pub struct Segment {
    pub mode: SegmentMode,
    pub images: Vec<Frame>,
    /// Strip width for `FixedSegment`; ignored for other modes
    pub width_hint: Option<u32>,
}

impl Segment {
    pub fn scroll(images: Vec<Frame>) -> Self {
        Self { mode: SegmentMode::Scroll, images, width_hint: None }
    }

    pub fn fixed(image: Frame, width: u32) -> Self {
        Self { mode: SegmentMode::FixedSegment, images: vec![image], width_hint: Some(width) }
    }
}

/// Capability contract every content source implements.
pub trait Plugin: Send + Sync {
    /// Stable identifier (registry key, config key, mailbox target).
    fn id(&self) -> &str;

    /// Declared display modes in preferred order. Must be non-empty; the
    /// first entry is the default mode.
    fn modes(&self) -> Vec<ModeDecl>;

    /// Draw `mode` onto `canvas`. Runs on the render tick: read cached state
    /// only, no I/O.
    fn render(&self, mode: &str, canvas: &mut Frame) -> Result<(), PluginError>;

    /// Refresh source data. Runs on the worker pool, never on the tick.
    fn update(&self) -> Result<(), PluginError> {
        Ok(())
    }

    // === Live priority (optional) ===

    /// True while the plugin has time-sensitive content (a game in progress,
    /// an alert). Cached by the resolver per live-poll cycle, not read every
    /// tick.
    fn has_live_content(&self) -> bool {
        false
    }

    /// Modes eligible while this plugin holds live priority. Empty means
    /// "all declared modes".
    fn live_modes(&self) -> Vec<String> {
        Vec::new()
    }

    // === Dynamic duration (optional) ===

    fn supports_dynamic_duration(&self) -> bool {
        false
    }

    /// True once the plugin has shown a full cycle of its content.
    fn is_cycle_complete(&self) -> bool {
        false
    }

    /// Called when rotation re-enters a dynamic-duration entry.
    fn reset_cycle_state(&self) {}

    /// Plugin-declared bound for dynamic duration; config may override.
    fn dynamic_cap(&self) -> Option<Duration> {
        None
    }

    // === Vegas (optional) ===

    /// Segments for the composite strip. `None` makes the compositor fall
    /// back to a one-shot full-frame capture of the default mode.
    fn vegas_content(&self) -> Option<Vec<Segment>> {
        None
    }

    fn vegas_mode(&self) -> SegmentMode {
        SegmentMode::Scroll
    }

    /// Declared strip width for `FixedSegment` content.
    fn vegas_width_hint(&self) -> Option<u32> {
        None
    }
}

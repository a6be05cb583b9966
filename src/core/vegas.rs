//! Vegas compositor - continuous multi-plugin scroll rendering.
//!
//! **Why**: Instead of one plugin owning the whole panel, every enabled
//! plugin contributes a segment to a single horizontal strip that moves
//! under one global cursor. Animation is time-based: the cursor advances by
//! `velocity * elapsed` pixels, never by a fixed per-frame step, so a slower
//! achieved tick rate costs smoothness but not speed.
//!
//! **Used by**: Engine (replaces direct rendering while Vegas is enabled).
//!
//! # Segment behaviors
//!
//! - `Scroll`: images appended end-to-end, ride the strip.
//! - `FixedSegment`: occupies its declared width (or a configured panel
//!   count) of strip space; content rides the strip unchanged.
//! - `Static`: when its slot reaches the visible window the cursor halts,
//!   the plugin renders full-frame for a dwell time, then the scroll resumes
//!   from the same position.
//!
//! Plugins without Vegas content are captured by rendering their default
//! mode into an offscreen buffer and treating it as a one-shot fixed
//! segment, refreshed on a bounded cadence.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::frame::Frame;
use crate::plugins::{PluginRegistry, SegmentMode};

/// Floating horizontal offset into the strip plus a velocity in px/s.
///
/// Sub-pixel accumulation: the position stays floating and is rounded only
/// at sampling time, which keeps slow scrolls stutter-free.
#[derive(Debug, Clone)]
pub struct ScrollCursor {
    pub position: f32,
    pub velocity: f32,
}

impl ScrollCursor {
    pub fn new(velocity: f32) -> Self {
        Self { position: 0.0, velocity }
    }

    /// Advance by wall-clock time, independent of tick rate.
    pub fn advance(&mut self, elapsed: Duration) {
        self.position += self.velocity * elapsed.as_secs_f32();
    }
}

/// Per-plugin Vegas behavior knobs (from settings).
#[derive(Debug, Clone, Default)]
pub struct VegasOptions {
    /// Scroll velocity, pixels per second
    pub velocity: f32,
    /// Wrap at the strip end (true) or stop and report cycle complete
    pub looped: bool,
    /// Width of one panel, used by panel-count overrides
    pub panel_width: u32,
    /// Full-frame dwell for Static segments
    pub static_dwell: Duration,
    /// Refresh cadence for fallback captures of segment-less plugins
    pub fallback_refresh: Duration,
    /// Per-plugin segment behavior override
    pub mode_overrides: HashMap<String, SegmentMode>,
    /// Per-plugin panel-count override for fixed segments
    pub panel_overrides: HashMap<String, u32>,
}

/// One laid-out slot of the strip.
struct StripSlot {
    plugin: String,
    mode: SegmentMode,
    x: f32,
    width: u32,
    images: Vec<Frame>,
}

struct StaticPause {
    plugin: String,
    remaining: Duration,
}

pub struct VegasCompositor {
    width: u32,
    height: u32,
    opts: VegasOptions,
    cursor: ScrollCursor,
    paused: Option<StaticPause>,
    /// Static plugins already shown this lap
    shown_static: HashSet<String>,
    /// Cached fallback captures: plugin -> (frame, captured_at)
    fallback: HashMap<String, (Frame, Instant)>,
    /// Shared animation gate; this compositor is the only writer
    animating: Arc<AtomicBool>,
    completed: bool,
}

impl VegasCompositor {
    pub fn new(width: u32, height: u32, opts: VegasOptions, animating: Arc<AtomicBool>) -> Self {
        let cursor = ScrollCursor::new(opts.velocity);
        Self {
            width,
            height,
            opts,
            cursor,
            paused: None,
            shown_static: HashSet::new(),
            fallback: HashMap::new(),
            animating,
            completed: false,
        }
    }

    pub fn cursor(&self) -> &ScrollCursor {
        &self.cursor
    }

    /// Non-loop mode only: true once the strip end reached the right edge.
    pub fn is_cycle_complete(&self) -> bool {
        self.completed
    }

    /// Restart the scroll from the strip head.
    pub fn reset_cycle(&mut self) {
        self.cursor.position = 0.0;
        self.completed = false;
        self.paused = None;
        self.shown_static.clear();
    }

    /// Produce the composite frame for this tick.
    pub fn render_tick(
        &mut self,
        now: Instant,
        elapsed: Duration,
        registry: &PluginRegistry,
    ) -> Frame {
        let slots = self.layout_strip(now, registry);
        let total: f32 = slots.iter().map(|s| s.width as f32).sum();

        if slots.is_empty() || total <= 0.0 {
            self.animating.store(false, Ordering::Relaxed);
            return Frame::new(self.width, self.height);
        }

        // Mid-dwell: the cursor is frozen, the static plugin owns the panel
        if let Some(pause) = &mut self.paused {
            if pause.remaining > elapsed {
                pause.remaining -= elapsed;
                let plugin = pause.plugin.clone();
                self.animating.store(false, Ordering::Relaxed);
                return self.render_static_frame(&plugin, registry);
            }
            trace!("Static dwell over for '{}', resuming scroll", pause.plugin);
            self.shown_static.insert(pause.plugin.clone());
            self.paused = None;
            // Resume from the same cursor position; no advancement this tick
        } else {
            self.advance_cursor(elapsed, total);
        }

        // Arrival check: a static slot reaching the window halts the scroll
        if let Some(slot) = slots.iter().find(|s| {
            s.mode == SegmentMode::Static
                && !self.shown_static.contains(&s.plugin)
                && self.cursor.position >= s.x
                && self.cursor.position < s.x + s.width as f32
        }) {
            debug!("Static segment '{}' reached window, halting scroll", slot.plugin);
            let plugin = slot.plugin.clone();
            self.paused = Some(StaticPause {
                plugin: plugin.clone(),
                remaining: self.opts.static_dwell,
            });
            self.animating.store(false, Ordering::Relaxed);
            return self.render_static_frame(&plugin, registry);
        }

        self.compose(&slots, total)
    }

    fn advance_cursor(&mut self, elapsed: Duration, total: f32) {
        let window = self.width as f32;
        if total <= window {
            // Strip fits on the panel: nothing to scroll, no cycle to run
            self.cursor.position = 0.0;
            self.animating.store(false, Ordering::Relaxed);
            return;
        }

        self.cursor.advance(elapsed);

        if self.opts.looped {
            if self.cursor.position >= total {
                self.cursor.position = self.cursor.position.rem_euclid(total);
                // New lap: static segments become eligible again
                self.shown_static.clear();
            }
            self.animating.store(true, Ordering::Relaxed);
        } else {
            let end = total - window;
            if self.cursor.position >= end {
                self.cursor.position = end;
                if !self.completed {
                    debug!("Vegas strip reached content end");
                }
                self.completed = true;
                self.animating.store(false, Ordering::Relaxed);
            } else {
                self.animating.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Gather segments for every healthy plugin, in display order, and lay
    /// them out left-to-right. Stale or absent segments are tolerated by
    /// construction: whatever the plugin last published is what rides.
    fn layout_strip(&mut self, now: Instant, registry: &PluginRegistry) -> Vec<StripSlot> {
        let mut slots = Vec::new();
        let mut x = 0.0f32;

        for id in registry.ids() {
            if !registry.is_healthy(&id) {
                continue;
            }

            let segments = match registry.vegas_segments_checked(&id) {
                Some(segments) => segments,
                None => match self.fallback_capture(&id, now, registry) {
                    Some(seg) => vec![seg],
                    None => continue,
                },
            };

            for seg in segments {
                let mode = self
                    .opts
                    .mode_overrides
                    .get(&id)
                    .copied()
                    .unwrap_or(seg.mode);
                let width = match mode {
                    SegmentMode::Scroll => seg.images.iter().map(Frame::width).sum(),
                    SegmentMode::FixedSegment => self
                        .opts
                        .panel_overrides
                        .get(&id)
                        .map(|panels| panels * self.opts.panel_width)
                        .or(seg.width_hint)
                        .or_else(|| seg.images.first().map(Frame::width))
                        .unwrap_or(0),
                    // Static slots occupy one window of strip space so the
                    // arrival check has a well-defined extent
                    SegmentMode::Static => self.width,
                };
                if width == 0 {
                    continue;
                }
                slots.push(StripSlot {
                    plugin: id.clone(),
                    mode,
                    x,
                    width,
                    images: seg.images,
                });
                x += width as f32;
            }
        }
        slots
    }

    /// One-shot fixed-segment capture for plugins without Vegas content.
    fn fallback_capture(
        &mut self,
        id: &str,
        now: Instant,
        registry: &PluginRegistry,
    ) -> Option<crate::plugins::Segment> {
        let fresh = match self.fallback.get(id) {
            Some((_, at)) => now.saturating_duration_since(*at) < self.opts.fallback_refresh,
            None => false,
        };
        if !fresh {
            let mode = registry.default_mode(id)?;
            let frame = registry.render_checked(id, &mode.name, self.width, self.height)?;
            self.fallback.insert(id.to_string(), (frame, now));
        }
        let (frame, _) = self.fallback.get(id)?;
        let width = frame.width();
        Some(crate::plugins::Segment::fixed(frame.clone(), width))
    }

    fn render_static_frame(&self, plugin: &str, registry: &PluginRegistry) -> Frame {
        registry
            .default_mode(plugin)
            .and_then(|mode| registry.render_checked(plugin, &mode.name, self.width, self.height))
            .unwrap_or_else(|| Frame::new(self.width, self.height))
    }

    /// Blit every visible slot at its rounded screen position. For looped
    /// strips the neighbors one lap away are drawn too, covering the seam.
    fn compose(&self, slots: &[StripSlot], total: f32) -> Frame {
        let mut canvas = Frame::new(self.width, self.height);
        let pos = self.cursor.position;
        let laps: &[f32] = if self.opts.looped { &[-1.0, 0.0, 1.0] } else { &[0.0] };

        for slot in slots {
            for lap in laps {
                let base = slot.x - pos + lap * total;
                if base + slot.width as f32 <= 0.0 || base >= self.width as f32 {
                    continue;
                }
                // Rounded only here, at sampling time
                let mut ix = base.round() as i32;
                for image in &slot.images {
                    canvas.blit(image, ix, 0);
                    ix += image.width() as i32;
                }
            }
        }
        canvas
    }
}

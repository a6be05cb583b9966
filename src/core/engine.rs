//! The render loop: ties resolver, compositor, mailbox, drivers together.
//!
//! # Architecture
//!
//! One logical thread steps at a bounded tick rate and never blocks on
//! plugin work:
//!
//! 1. drain the mailbox (bounded interval, not every tick)
//! 2. resolve the governing (plugin, mode) for this tick
//! 3. render — directly, or through the Vegas compositor when enabled
//! 4. hand the frame to the driver thread (never blocks; drops when behind)
//! 5. publish status at a bounded interval
//! 6. schedule due plugin updates on the worker pool
//! 7. drain deferred tasks if nothing is animating
//!
//! Plugin failures degrade to "retain the last good frame"; the only fatal
//! condition is the driver itself refusing frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::{debug, info, warn};

use crate::core::deferred::DeferredQueue;
use crate::core::mailbox::{
    now_epoch, ActiveOverride, DisplayCondition, MailboxAdapter, MailboxEvent, PublishedStatus,
};
use crate::core::resolver::{PriorityResolver, PriorityState, Selection, SelectionSource};
use crate::core::scheduler::{RotationEntry, RotationScheduler};
use crate::core::vegas::VegasCompositor;
use crate::core::workers::UpdatePool;
use crate::driver::DriverHandle;
use crate::frame::Frame;
use crate::plugins::PluginRegistry;
use crate::settings::Settings;

pub struct Engine {
    settings: Settings,
    registry: Arc<PluginRegistry>,
    resolver: PriorityResolver,
    vegas: Option<VegasCompositor>,
    deferred: DeferredQueue,
    adapter: MailboxAdapter,
    pool: UpdatePool,
    driver: DriverHandle,

    /// Set while Vegas is mid-scroll; gates the deferred queue
    animating: Arc<AtomicBool>,
    /// Flipped by a stop-with-shutdown command; the runner observes it
    shutdown: Arc<AtomicBool>,

    last_frame: Option<Frame>,
    last_selection: Option<Selection>,
    was_on_demand: bool,
    last_status_write: Option<Instant>,
    last_update_run: HashMap<String, Instant>,
    /// Most recent rejection, surfaced once through the status record
    pending_error: Option<String>,
}

impl Engine {
    pub fn new(
        settings: Settings,
        registry: Arc<PluginRegistry>,
        adapter: MailboxAdapter,
        driver: DriverHandle,
    ) -> Self {
        let animating = Arc::new(AtomicBool::new(false));
        let entries = settings.rotation_entries(&registry);
        info!("Rotation built: {} entries", entries.len());

        let resolver = PriorityResolver::new(
            RotationScheduler::new(entries),
            Duration::from_secs(settings.live.poll_interval_secs),
        );

        let vegas = if settings.vegas.enabled {
            info!(
                "Vegas mode enabled: {:.1} px/s, loop={}",
                settings.vegas.velocity, settings.vegas.looped
            );
            Some(VegasCompositor::new(
                settings.matrix.width,
                settings.matrix.height,
                settings.vegas_options(),
                Arc::clone(&animating),
            ))
        } else {
            None
        };

        let pool = UpdatePool::new(settings.worker_threads());

        Self {
            deferred: DeferredQueue::new(Arc::clone(&animating)),
            resolver,
            vegas,
            adapter,
            pool,
            driver,
            animating,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_frame: None,
            last_selection: None,
            was_on_demand: false,
            last_status_write: None,
            last_update_run: HashMap::new(),
            pending_error: None,
            registry,
            settings,
        }
    }

    /// Shared shutdown flag for the owning process.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn last_selection(&self) -> Option<&Selection> {
        self.last_selection.as_ref()
    }

    pub fn deferred_mut(&mut self) -> &mut DeferredQueue {
        &mut self.deferred
    }

    /// Re-apply a persisted on-demand override after a restart.
    pub fn recover(&mut self, now: Instant) {
        if let Some(cmd) = self.adapter.recover() {
            let request = cmd.request_id;
            match self.resolver.start_override(cmd, now, &self.registry) {
                Ok(()) => {
                    self.was_on_demand = true;
                    info!("Recovered on-demand override (request {})", request);
                }
                Err(e) => {
                    warn!("Persisted override no longer valid: {}", e);
                    self.adapter.clear_override();
                }
            }
        }
    }

    /// Swap in a new rotation list (enabled-set change between ticks).
    /// Queued plugin updates for the old set are cancelled via the epoch.
    pub fn rebuild_rotation(&mut self, entries: Vec<RotationEntry>) {
        self.pool.bump_epoch();
        self.resolver
            .rotation_mut()
            .rebuild(entries, &self.registry);
    }

    /// One step of the render loop.
    pub fn tick(&mut self, now: Instant, elapsed: Duration) -> Result<()> {
        self.apply_mailbox(now);

        let selection = self.resolver.tick(now, elapsed, &self.registry);

        // Override record lives exactly as long as the on-demand state
        let is_on_demand = matches!(self.resolver.state(), PriorityState::OnDemand { .. });
        if self.was_on_demand && !is_on_demand {
            self.adapter.clear_override();
        }
        self.was_on_demand = is_on_demand;

        let frame = self.render(now, elapsed, &selection);
        self.last_selection = selection;

        // Non-loop Vegas: a completed strip pass counts as one display
        // cycle — the underlying rotation slot advances, the strip restarts
        if let Some(vegas) = &mut self.vegas {
            if !self.settings.vegas.looped && vegas.is_cycle_complete() {
                self.resolver.rotation_mut().force_advance(&self.registry);
                vegas.reset_cycle();
            }
        }

        self.driver.present(frame);
        if self.driver.is_failed() {
            bail!("hardware driver failed to accept frames");
        }

        self.publish_status(now);
        self.schedule_updates(now);
        self.deferred.drain_if_idle();
        Ok(())
    }

    /// Blocking loop at the configured tick rate, until shutdown or a
    /// fatal driver error.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Engine running: {}x{} matrix, {} plugin(s)",
            self.settings.matrix.width,
            self.settings.matrix.height,
            self.registry.len()
        );
        let start = Instant::now();
        self.recover(start);
        self.adapter.publish_status(&PublishedStatus {
            condition: DisplayCondition::Restarting,
            ..PublishedStatus::idle()
        });

        let mut last = start;
        loop {
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(last);
            last = now;

            self.tick(now, elapsed)?;

            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested via mailbox, stopping engine");
                self.adapter.publish_status(&PublishedStatus::idle());
                return Ok(());
            }

            let budget = self.tick_budget();
            let spent = now.elapsed();
            if spent < budget {
                std::thread::sleep(budget - spent);
            }
        }
    }

    fn tick_budget(&self) -> Duration {
        let fps = if self.vegas.is_some() {
            self.settings.tick.vegas_fps
        } else {
            self.settings.tick.rotation_fps
        };
        Duration::from_secs_f32(1.0 / fps.max(1.0))
    }

    fn apply_mailbox(&mut self, now: Instant) {
        for event in self.adapter.poll(now) {
            match event {
                MailboxEvent::Start(cmd) => {
                    let record_mode = cmd.mode.clone();
                    let record_pinned = cmd.pinned;
                    let record_plugin = cmd.plugin.clone();
                    let request_id = cmd.request_id;
                    match self.resolver.start_override(cmd, now, &self.registry) {
                        Ok(()) => {
                            self.pending_error = None;
                            let expires_epoch = match self.resolver.state() {
                                PriorityState::OnDemand { expires_at: Some(at), .. } => {
                                    Some(now_epoch() + at.saturating_duration_since(now).as_secs())
                                }
                                _ => None,
                            };
                            self.adapter.persist_override(&ActiveOverride {
                                request_id,
                                plugin: record_plugin,
                                mode: record_mode,
                                pinned: record_pinned,
                                expires_epoch,
                            });
                            self.was_on_demand = true;
                        }
                        Err(e) => {
                            // Rejections surface only through the status
                            // record, never into the render loop
                            warn!("On-demand start rejected: {}", e);
                            self.pending_error = Some(e.to_string());
                        }
                    }
                }
                MailboxEvent::Stop { shutdown } => {
                    self.resolver.stop_override();
                    self.adapter.clear_override();
                    self.was_on_demand = false;
                    if shutdown {
                        self.shutdown.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    fn render(&mut self, now: Instant, elapsed: Duration, selection: &Option<Selection>) -> Frame {
        if let Some(vegas) = &mut self.vegas {
            let frame = vegas.render_tick(now, elapsed, &self.registry);
            self.last_frame = Some(frame.clone());
            return frame;
        }

        // Direct rendering: cuts between plugins, no continuous motion
        self.animating.store(false, Ordering::Relaxed);

        let (w, h) = (self.settings.matrix.width, self.settings.matrix.height);
        match selection {
            Some(sel) => match self.registry.render_checked(&sel.plugin, &sel.mode, w, h) {
                Some(frame) => {
                    self.last_frame = Some(frame.clone());
                    frame
                }
                None => {
                    // No content this tick: retain the previous valid frame
                    debug!("'{}' produced no frame, retaining last", sel.plugin);
                    self.last_frame.clone().unwrap_or_else(|| Frame::new(w, h))
                }
            },
            None => Frame::new(w, h),
        }
    }

    fn publish_status(&mut self, now: Instant) {
        let interval = Duration::from_millis(self.settings.mailbox.status_interval_ms.max(50));
        let due = self
            .last_status_write
            .map(|t| now.saturating_duration_since(t) >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_status_write = Some(now);

        let status = if let Some(message) = self.pending_error.take() {
            PublishedStatus::error(message)
        } else {
            match &self.last_selection {
                Some(sel) => PublishedStatus {
                    condition: DisplayCondition::Active,
                    plugin: Some(sel.plugin.clone()),
                    mode: Some(sel.mode.clone()),
                    source: Some(source_name(sel.source).to_string()),
                    remaining_secs: self.resolver.remaining(now).map(|d| d.as_secs()),
                    pinned: matches!(
                        self.resolver.state(),
                        PriorityState::OnDemand { pinned: true, .. }
                    ),
                    message: None,
                    updated_at: now_epoch(),
                },
                None => PublishedStatus::idle(),
            }
        };
        self.adapter.publish_status(&status);
    }

    /// Enqueue due plugin refreshes on the pool. The tick only ever
    /// enqueues; the slow work happens on worker threads.
    fn schedule_updates(&mut self, now: Instant) {
        let epoch = self.pool.current_epoch();
        for id in self.registry.ids() {
            if !self.registry.is_healthy(&id) {
                continue;
            }
            let interval = self.settings.update_interval(&id);
            let due = self
                .last_update_run
                .get(&id)
                .map(|t| now.saturating_duration_since(*t) >= interval)
                .unwrap_or(true);
            if !due {
                continue;
            }
            self.last_update_run.insert(id.clone(), now);
            let registry = Arc::clone(&self.registry);
            self.pool.execute_with_epoch(epoch, move || {
                registry.update_checked(&id);
            });
        }
    }
}

fn source_name(source: SelectionSource) -> &'static str {
    match source {
        SelectionSource::Rotation => "rotation",
        SelectionSource::LivePriority => "live",
        SelectionSource::OnDemand => "ondemand",
    }
}

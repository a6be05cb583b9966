//! On-demand mailbox: the entire cross-process control protocol.
//!
//! # Purpose
//!
//! An external actor (control surface, cron job, operator script) talks to
//! the engine through four TTL'd JSON records in a shared directory:
//!
//! - **request** — one file per command under `requests/`, keyed by
//!   `request_id`; dropped unread once its TTL lapses ("lost request", not
//!   an error)
//! - **processed** — id set with its own short TTL; the idempotency guard
//!   that makes a replayed request a no-op
//! - **override** — persisted while on-demand is active, for process-restart
//!   recovery
//! - **status** — continuously overwritten snapshot for observers; write-only
//!   from the engine's perspective
//!
//! No other channel exists between the scheduling core and any control
//! surface.
//!
//! # Thread safety
//!
//! The adapter is owned by the engine and polled from the render loop at a
//! bounded interval, never every tick. Store I/O failures are logged and
//! retried at the next interval; the loop keeps running on its last known
//! state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::resolver::StartOverride;

/// Seconds since the unix epoch (record timestamps).
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxAction {
    Start,
    Stop,
}

/// External command record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDemandRequest {
    pub request_id: Uuid,
    pub action: MailboxAction,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    /// 0 = until stopped; absent = plugin default
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub pinned: bool,
    /// Stop only: ask the host process to exit after clearing the override
    #[serde(default)]
    pub shutdown: bool,
    /// Unix seconds at write time; drives the request TTL
    pub timestamp: u64,
}

/// Externally observable display condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayCondition {
    Active,
    Idle,
    Restarting,
    Error,
}

/// Status record, overwritten wholesale. Has no behavioral effect on the
/// engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedStatus {
    pub condition: DisplayCondition,
    pub plugin: Option<String>,
    pub mode: Option<String>,
    pub source: Option<String>,
    pub remaining_secs: Option<u64>,
    pub pinned: bool,
    pub message: Option<String>,
    pub updated_at: u64,
}

impl PublishedStatus {
    pub fn idle() -> Self {
        Self {
            condition: DisplayCondition::Idle,
            plugin: None,
            mode: None,
            source: None,
            remaining_secs: None,
            pinned: false,
            message: None,
            updated_at: now_epoch(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            condition: DisplayCondition::Error,
            message: Some(message),
            ..Self::idle()
        }
    }
}

/// Persisted while an on-demand override is engaged (restart recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOverride {
    pub request_id: Uuid,
    pub plugin: String,
    pub mode: Option<String>,
    pub pinned: bool,
    /// Unix seconds; None = until stopped / pinned
    pub expires_epoch: Option<u64>,
}

/// Narrow store seam so tests and alternate backends swap in freely.
pub trait MailboxStore: Send {
    /// Drain all unread, unexpired requests in timestamp order.
    fn take_requests(&mut self) -> Result<Vec<OnDemandRequest>>;
    fn is_processed(&mut self, id: Uuid) -> bool;
    fn mark_processed(&mut self, id: Uuid) -> Result<()>;
    fn write_status(&mut self, status: &PublishedStatus) -> Result<()>;
    fn write_override(&mut self, record: &ActiveOverride) -> Result<()>;
    fn clear_override(&mut self) -> Result<()>;
    fn read_override(&mut self) -> Result<Option<ActiveOverride>>;
}

/// Filesystem-backed store: one JSON file per record.
pub struct FileStore {
    dir: PathBuf,
    request_ttl: Duration,
    processed_ttl: Duration,
    /// processed-id cache mirrored to processed.json
    processed: HashMap<Uuid, u64>,
    processed_loaded: bool,
}

impl FileStore {
    pub fn new(dir: PathBuf, request_ttl: Duration, processed_ttl: Duration) -> Result<Self> {
        fs::create_dir_all(dir.join("requests"))
            .with_context(|| format!("Failed to create mailbox dir: {}", dir.display()))?;
        Ok(Self {
            dir,
            request_ttl,
            processed_ttl,
            processed: HashMap::new(),
            processed_loaded: false,
        })
    }

    fn requests_dir(&self) -> PathBuf {
        self.dir.join("requests")
    }

    fn processed_path(&self) -> PathBuf {
        self.dir.join("processed.json")
    }

    fn status_path(&self) -> PathBuf {
        self.dir.join("status.json")
    }

    fn override_path(&self) -> PathBuf {
        self.dir.join("ondemand.json")
    }

    /// Write JSON via temp file + rename so observers never see a torn
    /// record.
    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    fn load_processed(&mut self) {
        if self.processed_loaded {
            return;
        }
        self.processed_loaded = true;
        match fs::read_to_string(self.processed_path()) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(map) => self.processed = map,
                Err(e) => warn!("Corrupt processed.json, starting empty: {}", e),
            },
            Err(_) => {} // first run
        }
    }

    /// Drop processed ids older than their TTL and persist the set.
    fn prune_and_save_processed(&mut self) -> Result<()> {
        let cutoff = now_epoch().saturating_sub(self.processed_ttl.as_secs());
        self.processed.retain(|_, at| *at >= cutoff);
        Self::write_json(&self.processed_path(), &self.processed)
    }
}

impl MailboxStore for FileStore {
    fn take_requests(&mut self) -> Result<Vec<OnDemandRequest>> {
        let dir = self.requests_dir();
        let mut requests = Vec::new();
        let cutoff = now_epoch().saturating_sub(self.request_ttl.as_secs());

        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let parsed: Option<OnDemandRequest> = fs::read_to_string(&path)
                .ok()
                .and_then(|json| serde_json::from_str(&json).ok());
            // Read-once: the file is consumed whether it parsed or not
            let _ = fs::remove_file(&path);

            match parsed {
                Some(req) if req.timestamp < cutoff => {
                    debug!("Request {} expired unread, dropping", req.request_id);
                }
                Some(req) => requests.push(req),
                None => warn!("Unreadable request file {}, dropping", path.display()),
            }
        }

        requests.sort_by_key(|r| r.timestamp);
        Ok(requests)
    }

    fn is_processed(&mut self, id: Uuid) -> bool {
        self.load_processed();
        let cutoff = now_epoch().saturating_sub(self.processed_ttl.as_secs());
        self.processed.get(&id).map(|at| *at >= cutoff).unwrap_or(false)
    }

    fn mark_processed(&mut self, id: Uuid) -> Result<()> {
        self.load_processed();
        self.processed.insert(id, now_epoch());
        self.prune_and_save_processed()
    }

    fn write_status(&mut self, status: &PublishedStatus) -> Result<()> {
        Self::write_json(&self.status_path(), status)
    }

    fn write_override(&mut self, record: &ActiveOverride) -> Result<()> {
        Self::write_json(&self.override_path(), record)
    }

    fn clear_override(&mut self) -> Result<()> {
        match fs::remove_file(self.override_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("clear override record"),
        }
    }

    fn read_override(&mut self) -> Result<Option<ActiveOverride>> {
        match fs::read_to_string(self.override_path()) {
            Ok(json) => Ok(serde_json::from_str(&json).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("read override record"),
        }
    }
}

/// Resolver-facing translation of one applied command.
#[derive(Debug)]
pub enum MailboxEvent {
    Start(StartOverride),
    Stop { shutdown: bool },
}

/// Polls the store at a bounded interval and applies each unread command
/// exactly once.
pub struct MailboxAdapter {
    store: Box<dyn MailboxStore>,
    poll_interval: Duration,
    last_poll: Option<Instant>,
}

impl MailboxAdapter {
    pub fn new(store: Box<dyn MailboxStore>, poll_interval: Duration) -> Self {
        Self { store, poll_interval, last_poll: None }
    }

    /// Drain the mailbox if the poll interval elapsed. Store failures are
    /// logged and retried next interval — never raised into the tick.
    pub fn poll(&mut self, now: Instant) -> Vec<MailboxEvent> {
        let due = self
            .last_poll
            .map(|t| now.saturating_duration_since(t) >= self.poll_interval)
            .unwrap_or(true);
        if !due {
            return Vec::new();
        }
        self.last_poll = Some(now);

        let requests = match self.store.take_requests() {
            Ok(r) => r,
            Err(e) => {
                warn!("Mailbox poll failed (will retry): {:#}", e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for req in requests {
            if self.store.is_processed(req.request_id) {
                debug!("Duplicate request {} ignored", req.request_id);
                continue;
            }
            if let Some(event) = translate(&req) {
                events.push(event);
            }
            if let Err(e) = self.store.mark_processed(req.request_id) {
                warn!("Failed to record processed id {}: {:#}", req.request_id, e);
            }
        }
        events
    }

    /// Re-apply a persisted override after a process restart, if still
    /// valid.
    pub fn recover(&mut self) -> Option<StartOverride> {
        let record = match self.store.read_override() {
            Ok(r) => r?,
            Err(e) => {
                warn!("Override recovery failed: {:#}", e);
                return None;
            }
        };
        let remaining = match record.expires_epoch {
            Some(at) => {
                let left = at.saturating_sub(now_epoch());
                if left == 0 {
                    info!("Persisted override expired during restart, discarding");
                    let _ = self.store.clear_override();
                    return None;
                }
                Some(Duration::from_secs(left))
            }
            None => Some(Duration::ZERO), // until stopped
        };
        info!("Recovering on-demand override for '{}'", record.plugin);
        Some(StartOverride {
            request_id: record.request_id,
            plugin: record.plugin,
            mode: record.mode,
            duration: if record.pinned { None } else { remaining },
            pinned: record.pinned,
        })
    }

    pub fn persist_override(&mut self, record: &ActiveOverride) {
        if let Err(e) = self.store.write_override(record) {
            warn!("Failed to persist override record: {:#}", e);
        }
    }

    pub fn clear_override(&mut self) {
        if let Err(e) = self.store.clear_override() {
            warn!("Failed to clear override record: {:#}", e);
        }
    }

    /// Overwrite the status record. Write-only: failures are logged, the
    /// engine does not depend on it.
    pub fn publish_status(&mut self, status: &PublishedStatus) {
        if let Err(e) = self.store.write_status(status) {
            warn!("Failed to publish status: {:#}", e);
        }
    }
}

/// Map a raw request onto a resolver event; malformed records are logged
/// and consumed.
fn translate(req: &OnDemandRequest) -> Option<MailboxEvent> {
    match req.action {
        MailboxAction::Start => {
            let Some(plugin) = req.plugin.clone() else {
                warn!("Start request {} without plugin, ignoring", req.request_id);
                return None;
            };
            Some(MailboxEvent::Start(StartOverride {
                request_id: req.request_id,
                plugin,
                mode: req.mode.clone(),
                duration: req.duration_secs.map(Duration::from_secs),
                pinned: req.pinned,
            }))
        }
        MailboxAction::Stop => Some(MailboxEvent::Stop { shutdown: req.shutdown }),
    }
}

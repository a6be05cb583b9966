//! Engine configuration: serde-backed JSON settings.
//!
//! Loaded once at startup by the runner and handed to the engine; never
//! reloaded mid-tick. A missing file is replaced with written-back defaults
//! so a fresh install has something to edit.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::scheduler::{EntryDuration, RotationEntry};
use crate::core::vegas::VegasOptions;
use crate::plugins::{PluginRegistry, SegmentMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for MatrixSettings {
    fn default() -> Self {
        Self { width: 64, height: 32 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickSettings {
    /// Frame cap for plain rotation rendering
    pub rotation_fps: f32,
    /// Frame cap while Vegas mode is scrolling
    pub vegas_fps: f32,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self { rotation_fps: 30.0, vegas_fps: 120.0 }
    }
}

/// Per-mode schedule override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeSchedule {
    pub mode: String,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub dynamic: Option<bool>,
}

/// One plugin's slot(s) in the rotation, in configured order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSchedule {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty = every mode the plugin declares
    #[serde(default)]
    pub modes: Vec<ModeSchedule>,
    #[serde(default)]
    pub dynamic_cap_secs: Option<u64>,
    #[serde(default)]
    pub update_interval_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub default_duration_secs: u64,
    /// Global bound for dynamic-duration entries
    pub dynamic_cap_secs: u64,
    /// Empty = all registered plugins in registration order
    pub plugins: Vec<PluginSchedule>,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            default_duration_secs: 10,
            dynamic_cap_secs: 90,
            plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VegasSettings {
    pub enabled: bool,
    /// Pixels per second
    pub velocity: f32,
    pub looped: bool,
    pub panel_width: u32,
    pub static_dwell_secs: u64,
    pub fallback_refresh_secs: u64,
    /// plugin id -> "scroll" | "fixed" | "static"
    pub mode_overrides: HashMap<String, String>,
    /// plugin id -> panel count for fixed segments
    pub panel_overrides: HashMap<String, u32>,
}

impl Default for VegasSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            velocity: 24.0,
            looped: true,
            panel_width: 64,
            static_dwell_secs: 8,
            fallback_refresh_secs: 2,
            mode_overrides: HashMap::new(),
            panel_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    pub poll_interval_secs: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self { poll_interval_secs: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxSettings {
    /// Store directory; None = `<data dir>/mailbox`
    pub dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub request_ttl_secs: u64,
    pub processed_ttl_secs: u64,
    pub status_interval_ms: u64,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: 500,
            request_ttl_secs: 60,
            processed_ttl_secs: 300,
            status_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: crate::plugins::registry::DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// 0 = auto (3/4 of cores)
    pub threads: usize,
    pub update_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { threads: 0, update_interval_secs: 60 }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub matrix: MatrixSettings,
    pub tick: TickSettings,
    pub rotation: RotationSettings,
    pub vegas: VegasSettings,
    pub live: LiveSettings,
    pub mailbox: MailboxSettings,
    pub health: HealthSettings,
    pub workers: WorkerSettings,
}

impl Settings {
    /// Load from `path`; a missing file gets defaults written back.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(json) => {
                let settings = serde_json::from_str(&json)
                    .with_context(|| format!("Malformed settings file {}", path.display()))?;
                info!("Settings loaded from {}", path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                if let Err(e) = settings.save(path) {
                    warn!("Could not write default settings: {:#}", e);
                } else {
                    info!("Default settings written to {}", path.display());
                }
                Ok(settings)
            }
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write {}", path.display()))
    }

    /// Worker thread count with the auto default applied.
    pub fn worker_threads(&self) -> usize {
        if self.workers.threads > 0 {
            self.workers.threads
        } else {
            (num_cpus::get() * 3 / 4).max(1)
        }
    }

    /// Per-plugin update cadence.
    pub fn update_interval(&self, plugin: &str) -> Duration {
        let secs = self
            .rotation
            .plugins
            .iter()
            .find(|p| p.id == plugin)
            .and_then(|p| p.update_interval_secs)
            .unwrap_or(self.workers.update_interval_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Build the rotation entry list against what is actually registered.
    /// Unknown plugins/modes in the config are logged and skipped.
    pub fn rotation_entries(&self, registry: &PluginRegistry) -> Vec<RotationEntry> {
        let schedules: Vec<PluginSchedule> = if self.rotation.plugins.is_empty() {
            registry
                .ids()
                .into_iter()
                .map(|id| PluginSchedule {
                    id,
                    enabled: true,
                    modes: Vec::new(),
                    dynamic_cap_secs: None,
                    update_interval_secs: None,
                })
                .collect()
        } else {
            self.rotation.plugins.clone()
        };

        let global_cap = Duration::from_secs(self.rotation.dynamic_cap_secs);
        let mut entries = Vec::new();

        for schedule in schedules.iter().filter(|s| s.enabled) {
            let Some(plugin) = registry.get(&schedule.id) else {
                warn!("Configured plugin '{}' is not registered, skipping", schedule.id);
                continue;
            };
            let cfg_cap = schedule.dynamic_cap_secs.map(Duration::from_secs);

            if schedule.modes.is_empty() {
                for decl in plugin.modes() {
                    entries.push(self.entry_for(
                        registry,
                        &schedule.id,
                        &decl.name,
                        None,
                        decl.dynamic && plugin.supports_dynamic_duration(),
                        decl.duration,
                        cfg_cap,
                        global_cap,
                    ));
                }
            } else {
                for mode_cfg in &schedule.modes {
                    let Some(decl) = registry.mode_decl(&schedule.id, &mode_cfg.mode) else {
                        warn!(
                            "Plugin '{}' declares no mode '{}', skipping",
                            schedule.id, mode_cfg.mode
                        );
                        continue;
                    };
                    let dynamic = mode_cfg.dynamic.unwrap_or(decl.dynamic)
                        && plugin.supports_dynamic_duration();
                    entries.push(self.entry_for(
                        registry,
                        &schedule.id,
                        &decl.name,
                        mode_cfg.duration_secs,
                        dynamic,
                        decl.duration,
                        cfg_cap,
                        global_cap,
                    ));
                }
            }
        }
        entries
    }

    #[allow(clippy::too_many_arguments)]
    fn entry_for(
        &self,
        registry: &PluginRegistry,
        id: &str,
        mode: &str,
        cfg_duration: Option<u64>,
        dynamic: bool,
        declared: Duration,
        cfg_cap: Option<Duration>,
        global_cap: Duration,
    ) -> RotationEntry {
        let duration = if dynamic {
            EntryDuration::Dynamic {
                cap: registry.dynamic_cap(id, cfg_cap, global_cap),
            }
        } else {
            EntryDuration::Fixed(
                cfg_duration
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| {
                        if declared.is_zero() {
                            Duration::from_secs(self.rotation.default_duration_secs)
                        } else {
                            declared
                        }
                    }),
            )
        };
        RotationEntry {
            plugin: id.to_string(),
            mode: mode.to_string(),
            duration,
        }
    }

    /// Compositor knobs derived from the Vegas section.
    pub fn vegas_options(&self) -> VegasOptions {
        let mode_overrides = self
            .vegas
            .mode_overrides
            .iter()
            .filter_map(|(id, name)| {
                parse_segment_mode(name).map(|m| (id.clone(), m)).or_else(|| {
                    warn!("Unknown vegas mode '{}' for plugin '{}'", name, id);
                    None
                })
            })
            .collect();

        VegasOptions {
            velocity: self.vegas.velocity,
            looped: self.vegas.looped,
            panel_width: self.vegas.panel_width,
            static_dwell: Duration::from_secs(self.vegas.static_dwell_secs),
            fallback_refresh: Duration::from_secs(self.vegas.fallback_refresh_secs),
            mode_overrides,
            panel_overrides: self.vegas.panel_overrides.clone(),
        }
    }
}

fn parse_segment_mode(name: &str) -> Option<SegmentMode> {
    match name.to_ascii_lowercase().as_str() {
        "scroll" => Some(SegmentMode::Scroll),
        "fixed" | "fixed_segment" => Some(SegmentMode::FixedSegment),
        "static" => Some(SegmentMode::Static),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::plugins::{ModeDecl, Plugin, PluginError};
    use std::sync::Arc;

    struct TwoModePlugin;

    impl Plugin for TwoModePlugin {
        fn id(&self) -> &str {
            "scores"
        }
        fn modes(&self) -> Vec<ModeDecl> {
            vec![
                ModeDecl::fixed("board", Duration::from_secs(12)),
                ModeDecl::dynamic("ticker", Duration::from_secs(30)),
            ]
        }
        fn render(&self, _mode: &str, _canvas: &mut Frame) -> Result<(), PluginError> {
            Ok(())
        }
        fn supports_dynamic_duration(&self) -> bool {
            true
        }
    }

    fn registry() -> PluginRegistry {
        let mut r = PluginRegistry::new(5);
        r.register(Arc::new(TwoModePlugin));
        r
    }

    #[test]
    fn test_defaults_roundtrip() {
        let dir = std::env::temp_dir().join(format!("marquee_settings_{}", uuid::Uuid::new_v4()));
        let path = dir.join("marquee.json");
        fs::create_dir_all(&dir).unwrap();

        let first = Settings::load_or_init(&path).unwrap();
        assert!(path.exists());
        let second = Settings::load_or_init(&path).unwrap();
        assert_eq!(first.matrix.width, second.matrix.width);
        assert_eq!(second.tick.rotation_fps, 30.0);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rotation_entries_default_all_modes() {
        let settings = Settings::default();
        let entries = settings.rotation_entries(&registry());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mode, "board");
        assert_eq!(entries[0].duration, EntryDuration::Fixed(Duration::from_secs(12)));
        assert_eq!(
            entries[1].duration,
            EntryDuration::Dynamic { cap: Duration::from_secs(90) }
        );
    }

    #[test]
    fn test_rotation_entries_config_overrides() {
        let mut settings = Settings::default();
        settings.rotation.plugins = vec![PluginSchedule {
            id: "scores".into(),
            enabled: true,
            modes: vec![ModeSchedule {
                mode: "board".into(),
                duration_secs: Some(42),
                dynamic: None,
            }],
            dynamic_cap_secs: None,
            update_interval_secs: None,
        }];
        let entries = settings.rotation_entries(&registry());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration, EntryDuration::Fixed(Duration::from_secs(42)));
    }

    #[test]
    fn test_rotation_entries_per_plugin_cap() {
        let mut settings = Settings::default();
        settings.rotation.plugins = vec![PluginSchedule {
            id: "scores".into(),
            enabled: true,
            modes: vec![ModeSchedule { mode: "ticker".into(), duration_secs: None, dynamic: None }],
            dynamic_cap_secs: Some(20),
            update_interval_secs: None,
        }];
        let entries = settings.rotation_entries(&registry());
        assert_eq!(
            entries[0].duration,
            EntryDuration::Dynamic { cap: Duration::from_secs(20) }
        );
    }

    #[test]
    fn test_unknown_plugin_skipped() {
        let mut settings = Settings::default();
        settings.rotation.plugins = vec![PluginSchedule {
            id: "ghost".into(),
            enabled: true,
            modes: Vec::new(),
            dynamic_cap_secs: None,
            update_interval_secs: None,
        }];
        assert!(settings.rotation_entries(&registry()).is_empty());
    }

    #[test]
    fn test_vegas_mode_override_parsing() {
        let mut settings = Settings::default();
        settings.vegas.mode_overrides.insert("a".into(), "static".into());
        settings.vegas.mode_overrides.insert("b".into(), "bogus".into());
        let opts = settings.vegas_options();
        assert_eq!(opts.mode_overrides.get("a"), Some(&SegmentMode::Static));
        assert!(!opts.mode_overrides.contains_key("b"));
    }
}

//! `jprof.toml` config loading, the settings store read at facade start, and
//! the agent-side configuration handle.

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{PackageFilterSet, ProfilerMode};

pub const SAMPLING_PERIOD_KEY: &str = "cpu.sampling.period";
pub const PROFILER_TYPE_KEY: &str = "cpu.profiler.type";
pub const PROFILED_PACKAGES_KEY: &str = "cpu.profiled.packages";

pub const DEFAULT_SAMPLING_PERIOD_MS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reporter {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for snapshots.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Sampling period applied when a facade is created.
    #[serde(default = "default_sampling_period")]
    pub sampling_period_ms: u32,

    /// Profiler mode applied when a facade is created.
    #[serde(default)]
    pub profiler_type: ProfilerMode,

    /// Previously selected package filters.
    #[serde(default)]
    pub profiled_packages: Vec<String>,

    /// Default reporter for CLI commands.
    #[serde(default)]
    pub reporter: Reporter,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".jprof")
}

fn default_sampling_period() -> u32 {
    DEFAULT_SAMPLING_PERIOD_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            sampling_period_ms: default_sampling_period(),
            profiler_type: ProfilerMode::default(),
            profiled_packages: Vec::new(),
            reporter: Reporter::default(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    /// Flattens the config into the key/value form the facade reads at start.
    pub fn settings(&self) -> MapSettings {
        let mut settings = MapSettings::default();
        settings.insert(SAMPLING_PERIOD_KEY, self.sampling_period_ms.to_string());
        settings.insert(PROFILER_TYPE_KEY, self.profiler_type.as_str());
        settings.insert(PROFILED_PACKAGES_KEY, self.profiled_packages.join(","));
        settings
    }
}

/// Plain string lookups supplied by whoever owns persisted preferences.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: BTreeMap<String, String>,
}

impl MapSettings {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }
}

impl SettingsStore for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Agent-side state that outlives individual remote calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    pub profiler_enabled: bool,
    pub dump_dir: PathBuf,
    pub profiled_packages: BTreeSet<String>,
    pub ignored_packages: BTreeSet<String>,
    pub profiled_classloaders: BTreeSet<String>,
}

impl AgentConfig {
    pub fn filters(&self) -> PackageFilterSet {
        PackageFilterSet {
            profiled: self.profiled_packages.clone(),
            ignored: self.ignored_packages.clone(),
            profiled_classloaders: self.profiled_classloaders.clone(),
        }
    }
}

/// Process-scoped handle to the agent config, shared by the controller side
/// and the remote contract of one attached agent.
#[derive(Debug, Clone, Default)]
pub struct AgentConfigHandle {
    inner: Arc<RwLock<AgentConfig>>,
}

impl AgentConfigHandle {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AgentConfig> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AgentConfig> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn missing_config_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("jprof-missing-{}.toml", Uuid::new_v4()));
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.base_dir, PathBuf::from(".jprof"));
        assert_eq!(cfg.sampling_period_ms, DEFAULT_SAMPLING_PERIOD_MS);
        assert_eq!(cfg.profiler_type, ProfilerMode::Sampling);
    }

    #[test]
    fn config_file_feeds_settings_store() {
        let path = std::env::temp_dir().join(format!("jprof-config-{}.toml", Uuid::new_v4()));
        std::fs::write(
            &path,
            "base_dir = \"/tmp/jp\"\nsampling_period_ms = 20\nprofiler_type = \"bci\"\nprofiled_packages = [\"com.acme.*\", \"org.demo\"]\n",
        )
        .expect("write config");
        let cfg = Config::load_optional(&path);
        let settings = cfg.settings();
        assert_eq!(settings.get(SAMPLING_PERIOD_KEY).as_deref(), Some("20"));
        assert_eq!(settings.get(PROFILER_TYPE_KEY).as_deref(), Some("bci"));
        assert_eq!(
            settings.get(PROFILED_PACKAGES_KEY).as_deref(),
            Some("com.acme.*,org.demo")
        );
        assert_eq!(cfg.snapshots_dir(), PathBuf::from("/tmp/jp/snapshots"));
    }

    #[test]
    fn unparsable_config_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("jprof-bad-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "sampling_period_ms = \"often\"").expect("write config");
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.sampling_period_ms, DEFAULT_SAMPLING_PERIOD_MS);
    }
}

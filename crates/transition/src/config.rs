//! YAML configuration for a swap host.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use worldswap_common::{BlockPos, EnvironmentId};
use worldswap_persist::SnapshotSource;

use crate::error::{ConfigError, ValidationError};
use crate::host::BuildLimits;
use crate::orchestrator::TransitionSettings;
use crate::rotation::{RotationMode, RotationSettings};

/// One swappable environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub id: EnvironmentId,
    /// Where players are placed after a swap, round-robin.
    #[serde(default)]
    pub spawns: Vec<Vec3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RotationConfig {
    pub mode: RotationMode,
    pub interval_seconds: u64,
    /// Rotation order. Empty means every configured environment.
    pub list: Vec<EnvironmentId>,
    pub exclude_current: bool,
    /// 0 rotates even with nobody online.
    pub min_occupancy: usize,
    pub seed: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            mode: RotationMode::Sequential,
            interval_seconds: 30 * 60,
            list: Vec::new(),
            exclude_current: true,
            min_occupancy: 1,
            seed: 0x5eed,
        }
    }
}

/// Everything a host needs to run transitions, previews and rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwapConfig {
    /// Paste origin for every environment.
    pub origin: BlockPos,
    /// Where occupants are sent while the region is rebuilt.
    pub fallback: Vec3,
    pub countdown_seconds: u32,
    pub suppression: bool,
    pub preview_seconds: u64,
    pub history_depth: Option<usize>,
    pub build_limits: BuildLimits,
    pub environments: Vec<EnvironmentConfig>,
    pub rotation: RotationConfig,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            origin: BlockPos::ORIGIN,
            fallback: Vec3::new(0.5, 100.0, 0.5),
            countdown_seconds: 10,
            suppression: true,
            preview_seconds: 30,
            history_depth: None,
            build_limits: BuildLimits::default(),
            environments: Vec::new(),
            rotation: RotationConfig::default(),
        }
    }
}

impl SwapConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text)?;
        tracing::debug!(path = %path.display(), environments = config.environments.len(), "config loaded");
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check ranges and cross references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for env in &self.environments {
            if env.id.is_empty() {
                return Err(ConfigError::Invalid("environment with empty id".into()));
            }
            if !seen.insert(&env.id) {
                return Err(ConfigError::Invalid(format!(
                    "environment '{}' is configured twice",
                    env.id
                )));
            }
        }
        if let Some(missing) = self.rotation.list.iter().find(|id| !seen.contains(id)) {
            return Err(ConfigError::Invalid(format!(
                "rotation lists unknown environment '{missing}'"
            )));
        }
        if self.rotation.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rotation.interval_seconds must be positive".into(),
            ));
        }
        if self.preview_seconds == 0 {
            return Err(ConfigError::Invalid("preview_seconds must be positive".into()));
        }
        if self.history_depth == Some(0) {
            return Err(ConfigError::Invalid("history_depth must be positive".into()));
        }
        if self.build_limits.min_y > self.build_limits.max_y {
            return Err(ConfigError::Invalid(format!(
                "build_limits.min_y {} is above max_y {}",
                self.build_limits.min_y, self.build_limits.max_y
            )));
        }
        Ok(())
    }

    pub fn environment(&self, id: &EnvironmentId) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|env| &env.id == id)
    }

    pub fn ids(&self) -> Vec<EnvironmentId> {
        self.environments.iter().map(|env| env.id.clone()).collect()
    }

    /// First reason `id` cannot be swapped to, checked cheapest first.
    pub fn validate_environment(
        &self,
        id: &EnvironmentId,
        source: &dyn SnapshotSource,
    ) -> Result<(), ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        let env = self
            .environment(id)
            .ok_or_else(|| ValidationError::NotConfigured(id.clone()))?;
        if !source.contains(id) {
            return Err(ValidationError::NoSnapshot(id.clone()));
        }
        if env.spawns.is_empty() {
            return Err(ValidationError::NoSpawnPoints(id.clone()));
        }
        Ok(())
    }

    pub fn transition_settings(&self) -> TransitionSettings {
        TransitionSettings {
            fallback: self.fallback,
            suppression: self.suppression,
            history_depth: self.history_depth,
        }
    }

    pub fn rotation_settings(&self) -> RotationSettings {
        let list = if self.rotation.list.is_empty() {
            self.ids()
        } else {
            self.rotation.list.clone()
        };
        RotationSettings {
            mode: self.rotation.mode,
            list,
            exclude_current: self.rotation.exclude_current,
            min_occupancy: self.rotation.min_occupancy,
            origin: self.origin,
            countdown_seconds: self.countdown_seconds,
            seed: self.rotation.seed,
        }
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation.interval_seconds)
    }

    pub fn preview_duration(&self) -> Duration {
        Duration::from_secs(self.preview_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::store;

    const SAMPLE: &str = r#"
origin: { x: 0, y: 64, z: 0 }
fallback: [0.5, 120.0, 0.5]
countdown_seconds: 5
environments:
  - id: arena1
    spawns: [[1.5, 65.0, 1.5], [4.5, 65.0, 4.5]]
  - id: arena2
    spawns: [[2.5, 65.0, 2.5]]
  - id: lobby
rotation:
  mode: random
  interval_seconds: 600
  list: [arena1, arena2]
  min_occupancy: 0
"#;

    #[test]
    fn parses_with_defaults() {
        let config = SwapConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.origin, BlockPos::new(0, 64, 0));
        assert_eq!(config.countdown_seconds, 5);
        assert!(config.suppression);
        assert_eq!(config.preview_duration(), Duration::from_secs(30));
        assert_eq!(config.rotation.mode, RotationMode::Random);
        assert!(config.rotation.exclude_current);

        let rotation = config.rotation_settings();
        assert_eq!(rotation.list, vec![EnvironmentId::from("arena1"), "arena2".into()]);
        assert_eq!(rotation.origin, config.origin);
        assert_eq!(config.transition_settings().fallback, Vec3::new(0.5, 120.0, 0.5));
    }

    #[test]
    fn empty_rotation_list_means_every_environment() {
        let config = SwapConfig::from_yaml_str("environments: [{id: a}, {id: b}]").unwrap();
        assert_eq!(config.rotation_settings().list, config.ids());
    }

    #[test]
    fn rejects_bad_references_and_ranges() {
        let dup = "environments: [{id: a}, {id: a}]";
        let unknown = "environments: [{id: a}]\nrotation: {list: [b]}";
        let zero = "rotation: {interval_seconds: 0}";
        let limits = "build_limits: {min_y: 10, max_y: 0}";
        for text in [dup, unknown, zero, limits] {
            assert!(
                matches!(SwapConfig::from_yaml_str(text), Err(ConfigError::Invalid(_))),
                "{text}"
            );
        }
        assert!(matches!(
            SwapConfig::from_yaml_str("colour: blue"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn survives_a_yaml_round_trip() {
        let config = SwapConfig::from_yaml_str(SAMPLE).unwrap();
        let text = config.to_yaml_string().unwrap();
        assert_eq!(SwapConfig::from_yaml_str(&text).unwrap(), config);
    }

    #[test]
    fn validate_environment_reports_first_problem() {
        let config = SwapConfig::from_yaml_str(SAMPLE).unwrap();
        let source = store(&["arena1", "lobby"]);

        assert_eq!(config.validate_environment(&"arena1".into(), &source), Ok(()));
        assert_eq!(
            config.validate_environment(&"".into(), &source),
            Err(ValidationError::EmptyId)
        );
        assert_eq!(
            config.validate_environment(&"mars".into(), &source),
            Err(ValidationError::NotConfigured("mars".into()))
        );
        assert_eq!(
            config.validate_environment(&"arena2".into(), &source),
            Err(ValidationError::NoSnapshot("arena2".into()))
        );
        assert_eq!(
            config.validate_environment(&"lobby".into(), &source),
            Err(ValidationError::NoSpawnPoints("lobby".into()))
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SwapConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

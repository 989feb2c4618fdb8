use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::labeler::MAX_KEYSPACE_ID;
use crate::types::{PlacementError, PlacementResult};

/// Placement engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Root path of every placement record in the durable store.
    pub key_root: String,
    /// Voter count of the reserved default rule.
    pub default_replica_count: u32,
    /// Isolation label of the reserved default rule.
    pub default_isolation_level: String,
    /// Records fetched per page while loading from the durable store.
    pub load_page_size: usize,
    /// Keyspace whose label rule is reserved.
    pub reserved_keyspace_id: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            key_root: String::from("/pd/0"),
            default_replica_count: 3,
            default_isolation_level: String::new(),
            load_page_size: 100,
            reserved_keyspace_id: 0,
        }
    }
}

impl PlacementConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: PlacementConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> PlacementResult<()> {
        if self.key_root.is_empty() {
            return Err(PlacementError::InvalidConfig("key_root is empty".into()));
        }
        if self.load_page_size == 0 {
            return Err(PlacementError::InvalidConfig(
                "load_page_size must be positive".into(),
            ));
        }
        if i32::try_from(self.default_replica_count).is_err() {
            return Err(PlacementError::InvalidConfig(format!(
                "default_replica_count {} is out of range",
                self.default_replica_count
            )));
        }
        if self.reserved_keyspace_id > MAX_KEYSPACE_ID {
            return Err(PlacementError::InvalidConfig(format!(
                "reserved_keyspace_id {} exceeds {}",
                self.reserved_keyspace_id, MAX_KEYSPACE_ID
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = PlacementConfig::default();
        assert_eq!(config.key_root, "/pd/0");
        assert_eq!(config.default_replica_count, 3);
        assert!(config.default_isolation_level.is_empty());
        assert_eq!(config.load_page_size, 100);
        assert_eq!(config.reserved_keyspace_id, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
key_root = "/pd/7"
default_replica_count = 5
default_isolation_level = "zone"
            "#
        )
        .unwrap();

        let config = PlacementConfig::from_file(file.path()).unwrap();
        assert_eq!(config.key_root, "/pd/7");
        assert_eq!(config.default_replica_count, 5);
        assert_eq!(config.default_isolation_level, "zone");
        assert_eq!(config.load_page_size, 100);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"load_page_size": 16, "reserved_keyspace_id": 2}}"#).unwrap();

        let config = PlacementConfig::from_file(file.path()).unwrap();
        assert_eq!(config.load_page_size, 16);
        assert_eq!(config.reserved_keyspace_id, 2);
        assert_eq!(config.key_root, "/pd/0");
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(PlacementConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_page() {
        let config = PlacementConfig {
            load_page_size: 0,
            ..PlacementConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PlacementError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_keyspace() {
        let config = PlacementConfig {
            reserved_keyspace_id: 0x0100_0000,
            ..PlacementConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PlacementError::InvalidConfig(_))
        ));

        let config = PlacementConfig {
            reserved_keyspace_id: MAX_KEYSPACE_ID,
            ..PlacementConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}

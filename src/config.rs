use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::{RepoError, RepoResult};

/// Environment variable overriding the configured database URL
pub const DATABASE_URL_ENV: &str = "RECORDGRAPH_DATABASE_URL";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: String,
    pub max_connections: u32,
    pub sqlx_logging: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            database_url: "sqlite://recordgraph.db?mode=rwc".to_string(),
            max_connections: 10,
            sqlx_logging: false,
        }
    }
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ..Default::default()
        }
    }

    pub fn sqlite(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn from_yaml(yaml: &str) -> RepoResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RepoError::Config(e.to_string()))
    }

    /// Read a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> RepoResult<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| RepoError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml(&yaml)?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.is_empty() {
                self.database_url = url;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_deserialization() {
        let config = StoreConfig::from_yaml(
            "backend: sqlite\ndatabase_url: sqlite::memory:\nmax_connections: 1\n",
        )
        .unwrap();

        assert_eq!(config.backend, StoreBackend::Sqlite);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.max_connections, 1);
        assert!(!config.sqlx_logging);
    }

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = StoreConfig::from_yaml("backend: memory\n").unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = StoreConfig::from_yaml("backend: oracle\n").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend: memory").unwrap();

        let config = StoreConfig::load(file.path()).unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_serialization() {
        let yaml = serde_yaml::to_string(&StoreConfig::memory()).unwrap();
        assert!(yaml.contains("backend: memory"));
    }
}

use crate::StorageError;
use cdb_core::{PriorityScheme, RollbackDates};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CASCADE_URLS_ENV: &str = "CDB_CASCADE_URLS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub permanent: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub databases: Vec<DatabaseConfig>,
    pub priority_scheme: PriorityScheme,
    pub time_gate_secs: Option<i64>,
    pub busy_timeout_ms: u64,
    pub rollback: BTreeMap<String, String>,
    pub rollback_type: BTreeMap<String, String>,
    pub temporary_tables_file: Option<PathBuf>,
    pub l2_cache_dir: Option<PathBuf>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            priority_scheme: PriorityScheme::default(),
            time_gate_secs: None,
            busy_timeout_ms: 5_000,
            rollback: BTreeMap::new(),
            rollback_type: BTreeMap::new(),
            temporary_tables_file: None,
            l2_cache_dir: None,
        }
    }
}

impl CascadeConfig {
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, StorageError> {
        let config: Self =
            toml::from_str(contents).map_err(|err| StorageError::Config(err.to_string()))?;
        if config.databases.iter().any(|db| db.url.trim().is_empty()) {
            return Err(StorageError::Config(
                "database entry with empty url".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let databases = urls
            .into_iter()
            .map(|url| url.as_ref().trim().to_string())
            .filter(|url| !url.is_empty())
            .map(DatabaseConfig::new)
            .collect();
        Self {
            databases,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, StorageError> {
        let urls = std::env::var(CASCADE_URLS_ENV)
            .map_err(|_| StorageError::Config(format!("{CASCADE_URLS_ENV} is not set")))?;
        let config = Self::from_urls(urls.split(';'));
        if config.databases.is_empty() {
            return Err(StorageError::Config(format!("{CASCADE_URLS_ENV} is empty")));
        }
        Ok(config)
    }

    pub fn time_gate(&self) -> Option<Duration> {
        self.time_gate_secs
            .filter(|secs| *secs > 0)
            .map(Duration::seconds)
    }

    pub fn rollback_dates(&self) -> RollbackDates {
        let mut dates = RollbackDates::new();
        for (pattern, date) in &self.rollback {
            if let Err(err) = dates.set_date(pattern, date) {
                warn!(event = "rollback_date_ignored", %pattern, %date, error = %err);
            }
        }
        for (pattern, kind) in &self.rollback_type {
            if let Err(err) = dates.set_type(pattern, kind) {
                warn!(event = "rollback_type_ignored", %pattern, %kind, error = %err);
            }
        }
        dates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdb_core::RollbackType;

    #[test]
    fn parses_full_cascade_definition() {
        let config = CascadeConfig::from_toml_str(
            r#"
            priority_scheme = "creation_date"
            time_gate_secs = 86400
            l2_cache_dir = "/tmp/cdb-l2"

            [[databases]]
            name = "local"
            url = "sqlite://local.db"
            permanent = true

            [[databases]]
            url = ":memory:"

            [rollback]
            "CAL*" = "2026-01-01 00:00:00"
            "GEOM" = "not a date"

            [rollback_type]
            "CAL*" = "CREATIONDATE"
            "#,
        )
        .expect("config");

        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.databases[0].name, "local");
        assert!(config.databases[0].permanent);
        assert!(!config.databases[1].permanent);
        assert_eq!(config.priority_scheme, PriorityScheme::CreationDate);
        assert_eq!(config.time_gate(), Some(Duration::days(1)));
        assert_eq!(config.busy_timeout_ms, 5_000);

        let rollback = config.rollback_dates();
        assert!(rollback.date_for("CALIB").is_some());
        assert!(rollback.date_for("GEOM").is_none());
        assert_eq!(rollback.type_for("CALIB"), RollbackType::CreationDate);
    }

    #[test]
    fn rejects_entries_without_url() {
        let err = CascadeConfig::from_toml_str("[[databases]]\nname = \"x\"\nurl = \" \"\n")
            .expect_err("empty url");
        assert!(err.to_string().contains("empty url"));
    }

    #[test]
    fn url_lists_skip_blank_entries() {
        let config = CascadeConfig::from_urls("a.db; ;:memory:".split(';'));
        let urls: Vec<&str> = config.databases.iter().map(|db| db.url.as_str()).collect();
        assert_eq!(urls, vec!["a.db", ":memory:"]);
        assert_eq!(config.priority_scheme, PriorityScheme::Epoch);
        assert_eq!(config.time_gate(), None);
    }
}

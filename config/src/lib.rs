use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Model hub API key.
pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";
/// Boolean-like flag selecting managed cloud credentials for the warehouse.
pub const MANAGED_AUTH_VAR: &str = "GOOGLE_GENAI_USE_VERTEXAI";
/// Comma separated list of `project.dataset.table` names.
pub const TABLES_VAR: &str = "BIGQUERY_TABLES";
/// Default warehouse project.
pub const PROJECT_VAR: &str = "GOOGLE_CLOUD_PROJECT";
/// Static OAuth bearer token for the warehouse API.
pub const ACCESS_TOKEN_VAR: &str = "BIGQUERY_ACCESS_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set, cannot locate the config directory")]
    NoHome,
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Process wide configuration. Built once at startup and handed to whoever needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub use_managed_auth: bool,
    pub ai: AIConfig,
    pub warehouse: WarehouseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AIConfig {
    pub model: String,
    /// Upper bound on tool call rounds answered for a single user prompt.
    pub max_tool_rounds: usize,
}

impl Default for AIConfig {
    fn default() -> Self {
        Self {
            model: "Qwen/Qwen3-4B".to_string(),
            max_tool_rounds: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub project: Option<String>,
    /// Fully qualified `project.dataset.table` names the agent should focus on.
    pub tables: Vec<String>,
    pub access_token: Option<String>,
    pub location: Option<String>,
    pub max_rows: u64,
    pub query_timeout_ms: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: None,
            tables: vec![],
            access_token: None,
            location: None,
            max_rows: 1000,
            query_timeout_ms: 30_000,
        }
    }
}

/// What `bq-agent show` prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    pub api_key_set: bool,
    pub tables: Vec<String>,
    pub use_managed_auth: bool,
    pub project: Option<String>,
}

impl AgentConfig {
    /// `$HOME/.config/bq-agent/config.toml`
    #[must_use]
    pub fn config_path() -> Option<PathBuf> {
        let home_dir = std::env::var("HOME").ok()?;
        Some(Path::new(&home_dir).join(".config/bq-agent/config.toml"))
    }

    /// Reads the config file, falling back to defaults when it is missing or broken.
    /// A broken file is reported as a warning.
    #[must_use]
    pub fn get_or_default() -> Self {
        let Some(path) = Self::config_path() else {
            return AgentConfig::default();
        };
        match Self::read_optional(&path) {
            Ok(conf) => conf.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Ignoring config file: {e}");
                AgentConfig::default()
            }
        }
    }

    /// Like [`AgentConfig::read_from`], but a missing file is `Ok(None)`.
    ///
    /// # Errors
    /// Fails when the file exists but cannot be read or is not valid TOML.
    pub fn read_optional(path: &Path) -> Result<Option<Self>, ConfigError> {
        match Self::read_from(path) {
            Ok(conf) => Ok(Some(conf)),
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Config file plus environment overrides.
    #[must_use]
    pub fn load() -> Self {
        Self::get_or_default().with_env(|key| std::env::var(key).ok())
    }

    /// # Errors
    /// Fails when the file cannot be read or is not valid TOML.
    pub fn read_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays values found through `lookup` on top of `self`. Unset or empty variables
    /// leave the current value alone.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(key) = get(API_KEY_VAR) {
            self.api_key = Some(key);
        }
        if let Some(flag) = get(MANAGED_AUTH_VAR) {
            self.use_managed_auth = parse_flag(&flag);
        }
        if let Some(tables) = get(TABLES_VAR) {
            self.warehouse.tables = parse_table_list(&tables);
        }
        if let Some(project) = get(PROJECT_VAR) {
            self.warehouse.project = Some(project.trim().to_string());
        }
        if let Some(token) = get(ACCESS_TOKEN_VAR) {
            self.warehouse.access_token = Some(token.trim().to_string());
        }
        self
    }

    /// Sets the API key and, when any are given, the configured tables.
    /// Managed auth is switched off, the key is used directly.
    #[must_use]
    pub fn setup(mut self, api_key: impl Into<String>, tables: &[String]) -> Self {
        self.api_key = Some(api_key.into());
        self.use_managed_auth = false;
        if !tables.is_empty() {
            self.warehouse.tables = tables.to_vec();
        }
        self
    }

    #[must_use]
    pub fn quick_setup_single_table(self, api_key: impl Into<String>, table: impl Into<String>) -> Self {
        self.setup(api_key, &[table.into()])
    }

    #[must_use]
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            api_key_set: self.api_key.as_deref().is_some_and(|key| !key.is_empty()),
            tables: self.warehouse.tables.clone(),
            use_managed_auth: self.use_managed_auth,
            project: self.warehouse.project.clone(),
        }
    }

    /// Environment assignments equivalent to this config, for `eval` in a shell.
    #[must_use]
    pub fn env_exports(&self) -> Vec<(&'static str, String)> {
        let mut exports = vec![];
        if let Some(key) = &self.api_key {
            exports.push((API_KEY_VAR, key.clone()));
        }
        let flag = if self.use_managed_auth { "1" } else { "0" };
        exports.push((MANAGED_AUTH_VAR, flag.to_string()));
        if !self.warehouse.tables.is_empty() {
            exports.push((TABLES_VAR, self.warehouse.tables.join(",")));
        }
        if let Some(project) = &self.warehouse.project {
            exports.push((PROJECT_VAR, project.clone()));
        }
        exports
    }

    /// Writes to [`AgentConfig::config_path`] and returns the path written.
    ///
    /// # Errors
    /// Fails without `HOME`, or when the file cannot be written.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// # Errors
    /// Fails when the directory or file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Splits a comma separated table list. Blank entries are dropped.
#[must_use]
pub fn parse_table_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|table| !table.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn table_list_drops_blank_entries() {
        assert_eq!(
            parse_table_list(" p.d.a, ,p.d.b,"),
            vec!["p.d.a".to_string(), "p.d.b".to_string()]
        );
        assert!(parse_table_list("").is_empty());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut base = AgentConfig::default();
        base.warehouse.tables = vec!["old.ds.t".to_string()];

        let conf = base.with_env(env(&[
            (API_KEY_VAR, "key-123"),
            (MANAGED_AUTH_VAR, "TRUE"),
            (TABLES_VAR, "proj.sales.orders,proj.sales.customers"),
            (PROJECT_VAR, "proj"),
        ]));

        assert_eq!(conf.api_key.as_deref(), Some("key-123"));
        assert!(conf.use_managed_auth);
        assert_eq!(
            conf.warehouse.tables,
            vec!["proj.sales.orders", "proj.sales.customers"]
        );
        assert_eq!(conf.warehouse.project.as_deref(), Some("proj"));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut base = AgentConfig::default();
        base.warehouse.tables = vec!["p.d.t".to_string()];
        let conf = base.clone().with_env(env(&[(TABLES_VAR, ""), (API_KEY_VAR, "  ")]));
        assert_eq!(conf, base);
    }

    #[test]
    fn managed_auth_flag_accepts_zero() {
        let mut base = AgentConfig::default();
        base.use_managed_auth = true;
        let conf = base.with_env(env(&[(MANAGED_AUTH_VAR, "0")]));
        assert!(!conf.use_managed_auth);
    }

    #[test]
    fn setup_keeps_tables_when_none_given() {
        let mut base = AgentConfig::default();
        base.use_managed_auth = true;
        base.warehouse.tables = vec!["p.d.t".to_string()];

        let conf = base.setup("AIza", &[]);
        assert_eq!(conf.api_key.as_deref(), Some("AIza"));
        assert!(!conf.use_managed_auth);
        assert_eq!(conf.warehouse.tables, vec!["p.d.t"]);
    }

    #[test]
    fn quick_setup_replaces_tables_with_one() {
        let mut base = AgentConfig::default();
        base.warehouse.tables = vec!["a.b.c".to_string(), "d.e.f".to_string()];
        let conf = base.quick_setup_single_table("AIza", "proj.sales.orders");
        assert_eq!(conf.warehouse.tables, vec!["proj.sales.orders"]);
        assert!(conf.summary().api_key_set);
    }

    #[test]
    fn summary_reports_missing_key() {
        let summary = AgentConfig::default().summary();
        assert!(!summary.api_key_set);
        assert!(summary.tables.is_empty());
        assert!(!summary.use_managed_auth);
    }

    #[test]
    fn exports_mirror_the_config() {
        let conf = AgentConfig::default().setup("k", &["p.d.t".to_string(), "p.d.u".to_string()]);
        assert_eq!(
            conf.env_exports(),
            vec![
                (API_KEY_VAR, "k".to_string()),
                (MANAGED_AUTH_VAR, "0".to_string()),
                (TABLES_VAR, "p.d.t,p.d.u".to_string()),
            ]
        );
    }

    #[test]
    fn save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut conf = AgentConfig::default().setup("k", &["p.d.t".to_string()]);
        conf.warehouse.project = Some("p".to_string());
        conf.ai.max_tool_rounds = 3;
        conf.save_to(&path).unwrap();

        assert_eq!(AgentConfig::read_from(&path).unwrap(), conf);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[warehouse]\ntables = [\"p.d.t\"]\n").unwrap();

        let conf = AgentConfig::read_from(&path).unwrap();
        assert_eq!(conf.warehouse.tables, vec!["p.d.t"]);
        assert_eq!(conf.warehouse.max_rows, 1000);
        assert_eq!(conf.ai, AIConfig::default());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(AgentConfig::read_optional(&path).unwrap().is_none());
    }

    #[test]
    fn broken_file_is_reported_when_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ai]\nmax_tool_rounds = \"many\"").unwrap();
        let err = AgentConfig::read_optional(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("invalid config file "));
    }

    #[test]
    fn broken_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "warehouse = 3").unwrap();
        assert!(matches!(
            AgentConfig::read_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}

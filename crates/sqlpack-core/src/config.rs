//! Configuration schema (sqlpack.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Deployment execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    /// Concatenate scripts and submit them as one transaction per batch
    Fast,

    /// Submit each change through an external SQL session process
    Stream,
}

impl Default for DeployStrategy {
    fn default() -> Self {
        Self::Fast
    }
}

impl std::fmt::Display for DeployStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

impl std::str::FromStr for DeployStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "stream" => Ok(Self::Stream),
            other => Err(ConfigError::ParseError(format!(
                "unknown deploy strategy '{}', expected 'fast' or 'stream'",
                other
            ))),
        }
    }
}

/// Target database connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
        }
    }
}

impl ConnectionConfig {
    /// Render as a libpq key/value connection string
    pub fn to_connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conn_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_conn_value(&self.user)),
            format!("dbname={}", quote_conn_value(&self.database)),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password={}", quote_conn_value(&self.password)));
        }
        parts.join(" ")
    }

    /// Environment variables understood by libpq clients such as `psql`
    pub fn libpq_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("PGHOST", self.host.clone()),
            ("PGPORT", self.port.to_string()),
            ("PGUSER", self.user.clone()),
            ("PGDATABASE", self.database.clone()),
        ];
        if !self.password.is_empty() {
            env.push(("PGPASSWORD", self.password.clone()));
        }
        env
    }

    /// Override fields from `PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD`, `PGDATABASE`
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PGHOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PGPORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::ParseError(format!("invalid PGPORT '{}'", port)))?;
        }
        if let Some(user) = lookup("PGUSER") {
            self.user = user;
        }
        if let Some(password) = lookup("PGPASSWORD") {
            self.password = password;
        }
        if let Some(database) = lookup("PGDATABASE") {
            self.database = database;
        }
        Ok(())
    }
}

fn quote_conn_value(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Deployment defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub strategy: DeployStrategy,

    /// Flatten dependency modules into the deployment (false assumes the
    /// database already provides them, e.g. as installed extensions)
    #[serde(default = "default_true")]
    pub use_plan: bool,

    /// Reuse resolved and compiled plans between runs in the same process
    #[serde(default)]
    pub cache: bool,

    /// Treat changes whose recorded hash differs from the current script as deployed
    #[serde(default)]
    pub allow_drift: bool,

    /// External SQL session binary used by the stream strategy
    #[serde(default = "default_psql")]
    pub psql: String,
}

fn default_true() -> bool {
    true
}

fn default_psql() -> String {
    "psql".to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            strategy: DeployStrategy::default(),
            use_plan: true,
            cache: false,
            allow_drift: false,
            psql: default_psql(),
        }
    }
}

/// Local workspace where fetched modules are materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_modules_dir")]
    pub modules: PathBuf,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from(".sqlpack/modules")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            modules: default_modules_dir(),
        }
    }
}

/// Where modules that are not yet local are fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// `<path>/<name>/<version>/` module directories
    Directory { path: PathBuf },

    /// HTTP (or file://) registry serving `<name>/@v/list` and `<name>/@v/<version>.zip`
    Registry { url: String },
}

/// Registry table placement inside the target database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_schema")]
    pub schema: String,
}

fn default_registry_schema() -> String {
    "sqlpack_registry".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            schema: default_registry_schema(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: ConnectionConfig,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: ConnectionConfig::default(),
            deploy: DeployConfig::default(),
            workspace: WorkspaceConfig::default(),
            registry: RegistryConfig::default(),
            sources: Vec::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Apply libpq environment overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.database.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Workspace modules directory resolved against the project root
    pub fn modules_dir(&self) -> PathBuf {
        if self.workspace.modules.is_absolute() {
            self.workspace.modules.clone()
        } else {
            self.project_root.join(&self.workspace.modules)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let schema = &self.registry.schema;
        let valid = !schema.is_empty()
            && schema.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !schema.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(ConfigError::ParseError(format!(
                "registry schema '{}' must be a lowercase SQL identifier",
                schema
            )));
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.deploy.strategy, DeployStrategy::Fast);
        assert!(config.deploy.use_plan);
        assert_eq!(config.registry.schema, "sqlpack_registry");
        assert_eq!(config.database.port, 5432);
    }

    #[test]
    fn parse_full_config() {
        let config = Config::from_toml(
            r#"
            [database]
            host = "db.internal"
            database = "app"

            [deploy]
            strategy = "stream"
            cache = true

            [[sources]]
            type = "directory"
            path = "/srv/modules"

            [[sources]]
            type = "registry"
            url = "https://modules.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.user, "postgres");
        assert_eq!(config.deploy.strategy, DeployStrategy::Stream);
        assert!(config.deploy.cache);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(
            config.sources[1],
            SourceConfig::Registry { url: "https://modules.example.com".to_string() }
        );
    }

    #[test]
    fn rejects_bad_registry_schema() {
        let err = Config::from_toml("[registry]\nschema = \"Bad-Name\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn env_overrides_connection() {
        let env: HashMap<&str, &str> = [("PGHOST", "pg"), ("PGPORT", "6543"), ("PGPASSWORD", "s3cret")]
            .into_iter()
            .collect();

        let mut conn = ConnectionConfig::default();
        conn.apply_env_with(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(conn.host, "pg");
        assert_eq!(conn.port, 6543);
        assert_eq!(conn.password, "s3cret");
        assert!(conn.to_connection_string().contains("password=s3cret"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut conn = ConnectionConfig::default();
        let result = conn.apply_env_with(|k| (k == "PGPORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn connection_string_quotes_values() {
        let conn = ConnectionConfig {
            password: "it's secret".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(conn.to_connection_string().ends_with("password='it\\'s secret'"));
    }

    #[test]
    fn config_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqlpack.toml");

        let mut config = Config::default();
        config.deploy.strategy = DeployStrategy::Stream;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.deploy.strategy, DeployStrategy::Stream);
        assert_eq!(loaded.project_root, dir.path());
        assert_eq!(loaded.modules_dir(), dir.path().join(".sqlpack/modules"));
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!("FAST".parse::<DeployStrategy>().unwrap(), DeployStrategy::Fast);
        assert_eq!("stream".parse::<DeployStrategy>().unwrap(), DeployStrategy::Stream);
        assert!("parallel".parse::<DeployStrategy>().is_err());
    }
}

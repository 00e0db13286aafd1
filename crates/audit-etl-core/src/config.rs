use crate::transform::TieBreak;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "db_config.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_LOG_FILE: &str = "etl_process.log";
pub const DEFAULT_SOURCE_TABLE: &str = "act_hi_detail";
pub const DEFAULT_TARGET_TABLE: &str = "target_table";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing config section [{0}]")]
    MissingSection(&'static str),
    #[error("missing config key `{0}`")]
    MissingKey(String),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbRole {
    Source,
    Target,
}

impl DbRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DbRole::Source => "source",
            DbRole::Target => "target",
        }
    }
}

impl fmt::Display for DbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    Postgres(PostgresConfig),
    Sqlite(SqliteConfig),
}

impl DatabaseConfig {
    pub fn backend(&self) -> &'static str {
        match self {
            DatabaseConfig::Postgres(_) => "postgres",
            DatabaseConfig::Sqlite(_) => "sqlite",
        }
    }

    /// Location for log lines; never includes credentials.
    pub fn describe(&self) -> String {
        match self {
            DatabaseConfig::Postgres(pg) => {
                format!("postgres://{}@{}:{}/{}", pg.user, pg.host, pg.port, pg.dbname)
            }
            DatabaseConfig::Sqlite(sqlite) => format!("sqlite://{}", sqlite.path.display()),
        }
    }
}

/// A plain or schema-qualified SQL identifier, safe to splice into statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(input: &str) -> Result<Self, String> {
        let parts = input.split('.').collect::<Vec<_>>();
        if parts.len() > 2 {
            return Err(format!("`{input}` has more than one schema qualifier"));
        }
        for part in &parts {
            let mut chars = part.chars();
            let valid_start = chars
                .next()
                .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
            if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                return Err(format!("`{input}` is not a plain SQL identifier"));
            }
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Table name without its schema qualifier.
    pub fn base_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    pub fn doc_id_index_name(&self) -> String {
        match self.base_name() {
            DEFAULT_TARGET_TABLE => "idx_doc_id".to_string(),
            base => format!("idx_{base}_doc_id"),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtlSettings {
    pub output_dir: PathBuf,
    pub log_file: PathBuf,
    pub tie_break: TieBreak,
    pub retain_artifact: bool,
    pub source_table: TableName,
    pub target_table: TableName,
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            tie_break: TieBreak::default(),
            retain_artifact: true,
            source_table: TableName(DEFAULT_SOURCE_TABLE.to_string()),
            target_table: TableName(DEFAULT_TARGET_TABLE.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtlConfig {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
    pub settings: EtlSettings,
}

impl EtlConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents)?;
        let source = raw
            .source
            .ok_or(ConfigError::MissingSection("source"))?
            .resolve(DbRole::Source)?;
        let target = raw
            .target
            .ok_or(ConfigError::MissingSection("target"))?
            .resolve(DbRole::Target)?;
        let settings = raw.etl.unwrap_or_default().resolve()?;
        Ok(Self {
            source,
            target,
            settings,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    source: Option<RawDatabaseSection>,
    target: Option<RawDatabaseSection>,
    etl: Option<RawEtlSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDatabaseSection {
    dbname: Option<String>,
    user: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<RawPort>,
    path: Option<PathBuf>,
}

// INI-style configs carry the port as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
}

impl RawDatabaseSection {
    fn resolve(self, role: DbRole) -> Result<DatabaseConfig, ConfigError> {
        if let Some(path) = self.path {
            return Ok(DatabaseConfig::Sqlite(SqliteConfig { path }));
        }

        let key = |name: &str| format!("{}.{name}", role.as_str());
        let port_key = key("port");
        let port = match self.port.ok_or_else(|| ConfigError::MissingKey(port_key.clone()))? {
            RawPort::Number(value) => u16::try_from(value).ok(),
            RawPort::Text(value) => value.trim().parse::<u16>().ok(),
        }
        .ok_or_else(|| ConfigError::InvalidValue {
            key: port_key,
            reason: "expected a port number between 0 and 65535".to_string(),
        })?;

        Ok(DatabaseConfig::Postgres(PostgresConfig {
            dbname: self.dbname.ok_or_else(|| ConfigError::MissingKey(key("dbname")))?,
            user: self.user.ok_or_else(|| ConfigError::MissingKey(key("user")))?,
            password: self
                .password
                .ok_or_else(|| ConfigError::MissingKey(key("password")))?,
            host: self.host.ok_or_else(|| ConfigError::MissingKey(key("host")))?,
            port,
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEtlSection {
    output_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    tie_break: Option<String>,
    retain_artifact: Option<bool>,
    source_table: Option<String>,
    target_table: Option<String>,
}

impl RawEtlSection {
    fn resolve(self) -> Result<EtlSettings, ConfigError> {
        let defaults = EtlSettings::default();
        let tie_break = match self.tie_break {
            Some(value) => value
                .parse::<TieBreak>()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: "etl.tie_break".to_string(),
                    reason,
                })?,
            None => defaults.tie_break,
        };
        let table = |key: &str, value: Option<String>, default: TableName| match value {
            Some(value) => TableName::parse(&value).map_err(|reason| ConfigError::InvalidValue {
                key: key.to_string(),
                reason,
            }),
            None => Ok(default),
        };

        Ok(EtlSettings {
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            log_file: self.log_file.unwrap_or(defaults.log_file),
            tie_break,
            retain_artifact: self.retain_artifact.unwrap_or(defaults.retain_artifact),
            source_table: table("etl.source_table", self.source_table, defaults.source_table)?,
            target_table: table("etl.target_table", self.target_table, defaults.target_table)?,
        })
    }
}

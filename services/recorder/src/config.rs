//! Recorder configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//!
//! # Required fields
//! - `experiment.name`
//! - `output.directory`
//! - `database.engine` (`sqlite:<path>` or `sqlite::memory:`)
//! - `server.endpoint` (`unix:/abs/path`, `tcp4:<port>:interface=<ipv4>` or
//!   `tcp6:<port>:interface=<ipv6>`)
//!
//! The output directory is created if missing; a directory sitting where one
//! of the output files should go is a configuration error, caught here so the
//! server never starts with an unexportable setup.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub experiment: ExperimentConfig,
    pub output: OutputConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: String,
    /// Metadata applied to every new experiment instance. Includes the
    /// `experiment_name`/`experiment_desc` entries folded in from `name` and
    /// `description`.
    pub default_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub record_file: String,
    pub metadata_file: String,
    pub times_file: String,
}

impl OutputConfig {
    pub fn record_path(&self) -> PathBuf {
        self.directory.join(&self.record_file)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.directory.join(&self.metadata_file)
    }

    pub fn times_path(&self) -> PathBuf {
        self.directory.join(&self.times_file)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    pub record_chunksize: usize,
    /// When false, the backing store file is deleted after a successful
    /// export on clean shutdown.
    pub persist: bool,
}

/// Parsed `database.engine` DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseEngine {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub backlog: u32,
}

/// Parsed `server.endpoint` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix { path: PathBuf },
    Tcp4 { port: u16, interface: Ipv4Addr },
    Tcp6 { port: u16, interface: Ipv6Addr },
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    experiment: Option<RawExperimentConfig>,
    output: Option<RawOutputConfig>,
    database: Option<RawDatabaseConfig>,
    server: Option<RawServerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawExperimentConfig {
    name: Option<String>,
    description: Option<String>,
    default_metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawOutputConfig {
    directory: Option<String>,
    record_file: Option<String>,
    metadata_file: Option<String>,
    times_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDatabaseConfig {
    engine: Option<String>,
    record_chunksize: Option<usize>,
    persist: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    endpoint: Option<String>,
    backlog: Option<u32>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load and validate recorder config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<RecorderConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load and validate recorder config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RecorderConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Experiment
    let raw_exp = raw
        .experiment
        .ok_or_else(|| ConfigError::MissingField("experiment".to_owned()))?;
    let name = raw_exp
        .name
        .ok_or_else(|| ConfigError::MissingField("experiment.name".to_owned()))?;
    let description = raw_exp.description.unwrap_or_default();
    let mut default_metadata = BTreeMap::new();
    default_metadata.insert("experiment_name".to_owned(), name.clone());
    default_metadata.insert("experiment_desc".to_owned(), description.clone());
    default_metadata.extend(raw_exp.default_metadata.unwrap_or_default());

    // Output
    let raw_out = raw
        .output
        .ok_or_else(|| ConfigError::MissingField("output".to_owned()))?;
    let directory = PathBuf::from(
        raw_out
            .directory
            .ok_or_else(|| ConfigError::MissingField("output.directory".to_owned()))?,
    );
    std::fs::create_dir_all(&directory).map_err(|e| {
        ConfigError::Io(format!(
            "creating output directory '{}': {}",
            directory.display(),
            e
        ))
    })?;
    let output = OutputConfig {
        directory,
        record_file: raw_out.record_file.unwrap_or_else(|| "records.csv".to_owned()),
        metadata_file: raw_out
            .metadata_file
            .unwrap_or_else(|| "metadata.json".to_owned()),
        times_file: raw_out.times_file.unwrap_or_else(|| "times.json".to_owned()),
    };
    for target in [
        output.record_path(),
        output.metadata_path(),
        output.times_path(),
    ] {
        if target.is_dir() {
            return Err(ConfigError::InvalidValue(format!(
                "output target '{}' is a directory",
                target.display()
            )));
        }
    }

    // Database
    let raw_db = raw
        .database
        .ok_or_else(|| ConfigError::MissingField("database".to_owned()))?;
    let engine_str = raw_db
        .engine
        .ok_or_else(|| ConfigError::MissingField("database.engine".to_owned()))?;
    let database = DatabaseConfig {
        engine: parse_engine(&engine_str)?,
        record_chunksize: raw_db.record_chunksize.unwrap_or(1000),
        persist: raw_db.persist.unwrap_or(false),
    };
    if database.record_chunksize == 0 {
        return Err(ConfigError::InvalidValue(
            "database.record_chunksize must be at least 1".to_owned(),
        ));
    }

    // Server
    let raw_srv = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let endpoint_str = raw_srv
        .endpoint
        .ok_or_else(|| ConfigError::MissingField("server.endpoint".to_owned()))?;
    let server = ServerConfig {
        endpoint: parse_endpoint(&endpoint_str)?,
        backlog: raw_srv.backlog.unwrap_or(50),
    };

    Ok(RecorderConfig {
        experiment: ExperimentConfig {
            name,
            description,
            default_metadata,
        },
        output,
        database,
        server,
    })
}

// ---------------------------------------------------------------------------
// DSN / endpoint parsing
// ---------------------------------------------------------------------------

/// Parse a `sqlite:` DSN. Accepts `sqlite::memory:`, `sqlite:<path>` and the
/// URI-style `sqlite:///<path>`.
pub fn parse_engine(s: &str) -> Result<DatabaseEngine, ConfigError> {
    let rest = s.strip_prefix("sqlite:").ok_or_else(|| {
        ConfigError::InvalidValue(format!("unsupported database engine '{s}'"))
    })?;
    if rest == ":memory:" || rest.is_empty() {
        return Ok(DatabaseEngine::Memory);
    }
    let path = rest.strip_prefix("//").unwrap_or(rest);
    Ok(DatabaseEngine::File(PathBuf::from(path)))
}

/// Parse a `server.endpoint` string into a typed endpoint.
pub fn parse_endpoint(s: &str) -> Result<Endpoint, ConfigError> {
    if let Some(path) = s.strip_prefix("unix:") {
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "unix endpoint path must be absolute: '{path}'"
            )));
        }
        return Ok(Endpoint::Unix {
            path: PathBuf::from(path),
        });
    }
    if let Some(rest) = s.strip_prefix("tcp4:") {
        let (port, iface) = split_tcp_endpoint(rest, s)?;
        let interface = iface
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidValue(format!("invalid IPv4 interface in '{s}'")))?;
        return Ok(Endpoint::Tcp4 { port, interface });
    }
    if let Some(rest) = s.strip_prefix("tcp6:") {
        let (port, iface) = split_tcp_endpoint(rest, s)?;
        let interface = iface
            .parse::<Ipv6Addr>()
            .map_err(|_| ConfigError::InvalidValue(format!("invalid IPv6 interface in '{s}'")))?;
        return Ok(Endpoint::Tcp6 { port, interface });
    }
    Err(ConfigError::InvalidValue(format!(
        "unsupported endpoint '{s}' (expected unix:, tcp4: or tcp6:)"
    )))
}

fn split_tcp_endpoint<'a>(rest: &'a str, full: &str) -> Result<(u16, &'a str), ConfigError> {
    let (port_str, iface_part) = rest.split_once(':').ok_or_else(|| {
        ConfigError::InvalidValue(format!("endpoint '{full}' is missing the interface part"))
    })?;
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidValue(format!("invalid port in '{full}'")))?;
    let iface = iface_part.strip_prefix("interface=").ok_or_else(|| {
        ConfigError::InvalidValue(format!("endpoint '{full}' must use interface=<addr>"))
    })?;
    Ok((port, iface))
}

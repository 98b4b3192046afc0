use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;
use veiltrace_core::{Principal, RegistryConfig};
use veiltrace_telemetry::TelemetryConfig;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub node: NodeSection,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSection {
    /// JSON-lines operation log replayed in order.
    #[serde(default = "default_journal")]
    pub journal: PathBuf,
    /// Hex-encoded 32-byte seed of the deterministic engine.
    pub engine_seed: String,
    /// Hex-encoded 32-byte key the simulated oracle signs deliveries with.
    pub oracle_key: String,
    #[serde(default = "default_oracle_principal")]
    pub oracle_principal: Principal,
    /// Deliver a genuine callback right after every accepted request.
    #[serde(default)]
    pub auto_deliver: bool,
}

fn default_journal() -> PathBuf {
    PathBuf::from("journals/demo.jsonl")
}

fn default_oracle_principal() -> Principal {
    Principal::new("did:veiltrace:oracle")
}

fn decode_key(field: &str, value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value)
        .map_err(|err| ConfigError::Validation(format!("{field} is not hex: {err}")))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ConfigError::Validation(format!("{field} must be 32 bytes")))
}

impl NodeSection {
    pub fn engine_seed(&self) -> Result<[u8; 32], ConfigError> {
        decode_key("engine-seed", &self.engine_seed)
    }

    pub fn oracle_key(&self) -> Result<[u8; 32], ConfigError> {
        decode_key("oracle-key", &self.oracle_key)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.engine_seed()?;
        self.node.oracle_key()?;
        self.registry
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        if let Some(origin) = &self.registry.callback_origin {
            if origin != &self.node.oracle_principal {
                return Err(ConfigError::Validation(format!(
                    "callback origin {origin} differs from oracle principal {}",
                    self.node.oracle_principal
                )));
            }
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            node: NodeSection {
                journal: default_journal(),
                engine_seed: "11".repeat(32),
                oracle_key: "22".repeat(32),
                oracle_principal: default_oracle_principal(),
                auto_deliver: false,
            },
            registry: RegistryConfig::default().with_callback_origin(default_oracle_principal()),
            telemetry: TelemetryConfig::sample("veiltrace-node"),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

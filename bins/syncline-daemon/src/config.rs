use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use syncline_core::config::{CommunicationProtocol, Config, NodeType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
    #[error("validation {0}")]
    Validation(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListeningType {
    Secure,
    #[default]
    Unsecure,
    Both,
    Unix,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListeningConfig {
    #[serde(default)]
    pub listening_type: ListeningType,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_unsecure_port")]
    pub unsecure_port: u16,
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    #[serde(default)]
    pub server_certificate: String,
    #[serde(default)]
    pub server_key: String,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_unsecure_port() -> u16 {
    8080
}

fn default_secure_port() -> u16 {
    8443
}

impl Default for ListeningConfig {
    fn default() -> Self {
        Self {
            listening_type: ListeningType::Unsecure,
            address: default_address(),
            unsecure_port: default_unsecure_port(),
            secure_port: default_secure_port(),
            server_certificate: String::new(),
            server_key: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub sync: Config,
    #[serde(default)]
    pub listening: ListeningConfig,
}

impl DaemonConfig {
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.sync
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;

        if self.sync.node_type == NodeType::Ess {
            return Err(ConfigError::Validation(
                "the daemon serves CSS nodes; an ESS embeds syncline-core with its transport client"
                    .to_string(),
            ));
        }
        if self.sync.communication_protocol != CommunicationProtocol::Http {
            return Err(ConfigError::Validation(
                "no broker transport is wired into the daemon; use the http protocol".to_string(),
            ));
        }

        match self.listening.listening_type {
            ListeningType::Unix => {
                return Err(ConfigError::Validation(
                    "unix listening is only available on an ESS".to_string(),
                ));
            }
            ListeningType::Secure | ListeningType::Both => {
                return Err(ConfigError::Validation(
                    "secure listening requires TLS termination in front of the daemon".to_string(),
                ));
            }
            ListeningType::Unsecure => {
                if self.listening.unsecure_port == 0 {
                    return Err(ConfigError::Validation(
                        "unsecure listening requested with a zero port".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Environment variables override the file: SYNCLINE_<OPTION>.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("SYNCLINE_ORG_ID") {
            self.sync.org_id = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_DESTINATION_TYPE") {
            self.sync.destination_type = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_DESTINATION_ID") {
            self.sync.destination_id = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_LOG_LEVEL") {
            self.sync.log_level = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_PERSISTENCE_ROOT_PATH") {
            self.sync.persistence_root_path = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_UNSECURE_LISTENING_PORT") {
            if let Ok(port) = value.parse() {
                self.listening.unsecure_port = port;
            }
        }
        if let Ok(value) = std::env::var("SYNCLINE_RESEND_INTERVAL") {
            if let Ok(secs) = value.parse() {
                self.sync.resend_interval_secs = secs;
            }
        }
        if let Ok(value) = std::env::var("SYNCLINE_MAX_DATA_CHUNK_SIZE") {
            if let Ok(size) = value.parse() {
                self.sync.max_data_chunk_size = size;
            }
        }
        if let Ok(value) = std::env::var("SYNCLINE_ESS_PERSISTENT_STORAGE") {
            self.sync.ess_persistent_storage = value == "true" || value == "1";
        }
        if let Ok(value) = std::env::var("SYNCLINE_MONGO_ADDRESS_CSV") {
            self.sync.mongo_address_csv = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_MONGO_DB_NAME") {
            self.sync.mongo_db_name = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_MONGO_USERNAME") {
            self.sync.mongo_username = value;
        }
        if let Ok(value) = std::env::var("SYNCLINE_MONGO_PASSWORD") {
            self.sync.mongo_password = value;
        }
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut parsed: DaemonConfig = toml::from_str(&content).map_err(|_| ConfigError::Parse)?;
    parsed.apply_env();
    parsed.validate()?;
    Ok(parsed)
}

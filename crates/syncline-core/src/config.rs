use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "CSS", alias = "css")]
    Css,
    #[serde(rename = "ESS", alias = "ess")]
    Ess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CommunicationProtocol {
    #[default]
    Http,
    Mqtt,
    Wiotp,
    HybridMqtt,
    HybridWiotp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttParallelMode {
    #[default]
    None,
    Small,
    Medium,
    Large,
}

/// Engine configuration. The daemon layers listening/TLS options on top.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_type: NodeType,
    #[serde(default)]
    pub org_id: String,
    pub destination_type: String,
    pub destination_id: String,
    #[serde(default)]
    pub communication_protocol: CommunicationProtocol,

    #[serde(default = "default_persistence_root_path")]
    pub persistence_root_path: String,
    #[serde(default)]
    pub ess_persistent_storage: bool,

    #[serde(default = "default_resend_interval_secs")]
    pub resend_interval_secs: u64,
    #[serde(default = "default_object_activation_interval_secs")]
    pub object_activation_interval_secs: u64,
    #[serde(default = "default_storage_maintenance_interval_secs")]
    pub storage_maintenance_interval_secs: u64,
    #[serde(default = "default_leadership_timeout_secs")]
    pub leadership_timeout_secs: u64,
    #[serde(default = "default_destination_liveness_timeout_secs")]
    pub destination_liveness_timeout_secs: u64,
    #[serde(default = "default_messaging_group_cache_expiration_minutes")]
    pub messaging_group_cache_expiration_minutes: u64,

    #[serde(default = "default_max_data_chunk_size")]
    pub max_data_chunk_size: usize,
    #[serde(default = "default_max_inflight_chunks")]
    pub max_inflight_chunks: usize,
    #[serde(default = "default_max_chunk_buffer_bytes")]
    pub max_chunk_buffer_bytes: usize,

    #[serde(default = "default_http_polling_interval_secs")]
    pub http_polling_interval_secs: u64,
    #[serde(default)]
    pub http_css_host: String,
    #[serde(default)]
    pub http_css_port: u16,
    #[serde(default)]
    pub http_css_use_ssl: bool,

    #[serde(default)]
    pub mqtt_client_id: String,
    #[serde(default)]
    pub mqtt_user_name: String,
    #[serde(default)]
    pub mqtt_password: String,
    #[serde(default)]
    pub broker_address: String,
    #[serde(default)]
    pub broker_port: u16,
    #[serde(default)]
    pub mqtt_parallel_mode: MqttParallelMode,

    #[serde(default = "default_mongo_address_csv")]
    pub mongo_address_csv: String,
    #[serde(default = "default_mongo_auth_db_name")]
    pub mongo_auth_db_name: String,
    #[serde(default = "default_mongo_db_name")]
    pub mongo_db_name: String,
    #[serde(default)]
    pub mongo_username: String,
    #[serde(default)]
    pub mongo_password: String,
    #[serde(default)]
    pub mongo_use_ssl: bool,
    #[serde(default)]
    pub mongo_ca_certificate: String,
    #[serde(default)]
    pub mongo_allow_invalid_certificates: bool,
    #[serde(default = "default_mongo_session_cache_size")]
    pub mongo_session_cache_size: usize,
    #[serde(default = "default_database_connect_timeout_secs")]
    pub database_connect_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Hard cap on the inflight window of a CSS.
pub const CSS_MAX_INFLIGHT_CHUNKS: usize = 64;

fn default_persistence_root_path() -> String {
    "/var/syncline/persist".to_string()
}

fn default_resend_interval_secs() -> u64 {
    5
}

fn default_object_activation_interval_secs() -> u64 {
    30
}

fn default_storage_maintenance_interval_secs() -> u64 {
    30
}

fn default_leadership_timeout_secs() -> u64 {
    30
}

fn default_destination_liveness_timeout_secs() -> u64 {
    24 * 3600
}

fn default_messaging_group_cache_expiration_minutes() -> u64 {
    60
}

fn default_max_data_chunk_size() -> usize {
    120 * 1024
}

fn default_max_inflight_chunks() -> usize {
    1
}

fn default_max_chunk_buffer_bytes() -> usize {
    1024 * 1024
}

fn default_http_polling_interval_secs() -> u64 {
    10
}

fn default_mongo_address_csv() -> String {
    "localhost:27017".to_string()
}

fn default_mongo_auth_db_name() -> String {
    "admin".to_string()
}

fn default_mongo_db_name() -> String {
    "syncline".to_string()
}

fn default_mongo_session_cache_size() -> usize {
    1
}

fn default_database_connect_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_type: NodeType::Css,
            org_id: String::new(),
            destination_type: String::new(),
            destination_id: String::new(),
            communication_protocol: CommunicationProtocol::Http,
            persistence_root_path: default_persistence_root_path(),
            ess_persistent_storage: false,
            resend_interval_secs: default_resend_interval_secs(),
            object_activation_interval_secs: default_object_activation_interval_secs(),
            storage_maintenance_interval_secs: default_storage_maintenance_interval_secs(),
            leadership_timeout_secs: default_leadership_timeout_secs(),
            destination_liveness_timeout_secs: default_destination_liveness_timeout_secs(),
            messaging_group_cache_expiration_minutes:
                default_messaging_group_cache_expiration_minutes(),
            max_data_chunk_size: default_max_data_chunk_size(),
            max_inflight_chunks: default_max_inflight_chunks(),
            max_chunk_buffer_bytes: default_max_chunk_buffer_bytes(),
            http_polling_interval_secs: default_http_polling_interval_secs(),
            http_css_host: String::new(),
            http_css_port: 0,
            http_css_use_ssl: false,
            mqtt_client_id: String::new(),
            mqtt_user_name: String::new(),
            mqtt_password: String::new(),
            broker_address: String::new(),
            broker_port: 0,
            mqtt_parallel_mode: MqttParallelMode::None,
            mongo_address_csv: default_mongo_address_csv(),
            mongo_auth_db_name: default_mongo_auth_db_name(),
            mongo_db_name: default_mongo_db_name(),
            mongo_username: String::new(),
            mongo_password: String::new(),
            mongo_use_ssl: false,
            mongo_ca_certificate: String::new(),
            mongo_allow_invalid_certificates: false,
            mongo_session_cache_size: default_mongo_session_cache_size(),
            database_connect_timeout_secs: default_database_connect_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Validates the configuration and normalizes node-type dependent values.
    pub fn validate(&mut self) -> Result<(), SyncError> {
        if self.destination_type.trim().is_empty() {
            return Err(SyncError::Config("destination_type is required".to_string()));
        }
        if self.destination_id.trim().is_empty() {
            return Err(SyncError::Config("destination_id is required".to_string()));
        }
        if self.node_type == NodeType::Ess && self.org_id.trim().is_empty() {
            return Err(SyncError::Config("org_id is required on an ESS".to_string()));
        }

        if self.max_inflight_chunks < 1 {
            self.max_inflight_chunks = 1;
        }
        if self.node_type == NodeType::Css && self.max_inflight_chunks > CSS_MAX_INFLIGHT_CHUNKS {
            self.max_inflight_chunks = CSS_MAX_INFLIGHT_CHUNKS;
        }
        if self.max_data_chunk_size == 0 {
            return Err(SyncError::Config(
                "max_data_chunk_size must be positive".to_string(),
            ));
        }
        if self.resend_interval_secs == 0 {
            return Err(SyncError::Config(
                "resend_interval_secs must be positive".to_string(),
            ));
        }
        if self.leadership_timeout_secs == 0 {
            return Err(SyncError::Config(
                "leadership_timeout_secs must be positive".to_string(),
            ));
        }

        if self.node_type == NodeType::Ess
            && self.communication_protocol == CommunicationProtocol::Http
            && (self.http_css_host.is_empty() || self.http_css_port == 0)
        {
            return Err(SyncError::Config(
                "http_css_host and http_css_port are required for ESS over HTTP".to_string(),
            ));
        }

        if matches!(
            self.communication_protocol,
            CommunicationProtocol::HybridMqtt | CommunicationProtocol::HybridWiotp
        ) && self.node_type == NodeType::Ess
        {
            return Err(SyncError::Config(
                "an ESS must use a single communication protocol".to_string(),
            ));
        }

        if self.mongo_address_csv.trim().is_empty() {
            return Err(SyncError::Config(
                "mongo_address_csv must not be empty".to_string(),
            ));
        }
        if self.mongo_username.is_empty() && !self.mongo_password.is_empty() {
            return Err(SyncError::Config(
                "mongo_username is required when mongo_password is set".to_string(),
            ));
        }
        if self.mongo_session_cache_size < 1 {
            self.mongo_session_cache_size = 1;
        }
        if self.database_connect_timeout_secs == 0 {
            return Err(SyncError::Config(
                "database_connect_timeout_secs must be positive".to_string(),
            ));
        }

        if !self.persistence_root_path.ends_with('/') {
            self.persistence_root_path.push('/');
        }
        Ok(())
    }

    /// The Destination record this node registers as (ESS).
    pub fn node_destination(&self) -> syncline_api::Destination {
        syncline_api::Destination {
            org_id: self.org_id.clone(),
            dest_type: self.destination_type.clone(),
            dest_id: self.destination_id.clone(),
            communication: match self.communication_protocol {
                CommunicationProtocol::Http => "http".to_string(),
                CommunicationProtocol::Mqtt => "mqtt".to_string(),
                CommunicationProtocol::Wiotp => "wiotp".to_string(),
                CommunicationProtocol::HybridMqtt => "hybrid-mqtt".to_string(),
                CommunicationProtocol::HybridWiotp => "hybrid-wiotp".to_string(),
            },
            code_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        let mut cfg = Config::default();
        cfg.destination_type = "cloud".to_string();
        cfg.destination_id = "css1".to_string();
        cfg
    }

    #[test]
    fn css_inflight_window_is_capped() {
        let mut cfg = base();
        cfg.max_inflight_chunks = 1000;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_inflight_chunks, CSS_MAX_INFLIGHT_CHUNKS);

        let mut cfg = base();
        cfg.node_type = NodeType::Ess;
        cfg.org_id = "org".to_string();
        cfg.http_css_host = "localhost".to_string();
        cfg.http_css_port = 8080;
        cfg.max_inflight_chunks = 1000;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_inflight_chunks, 1000);
    }

    #[test]
    fn ess_requires_org_and_css_endpoint() {
        let mut cfg = base();
        cfg.node_type = NodeType::Ess;
        assert!(cfg.validate().is_err());
        cfg.org_id = "org".to_string();
        assert!(cfg.validate().is_err());
        cfg.http_css_host = "localhost".to_string();
        cfg.http_css_port = 8080;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn ess_rejects_hybrid_protocols() {
        let mut cfg = base();
        cfg.node_type = NodeType::Ess;
        cfg.org_id = "org".to_string();
        cfg.communication_protocol = CommunicationProtocol::HybridMqtt;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mongo_options_are_recognized_and_checked() {
        let mut cfg = base();
        cfg.validate().unwrap();
        assert_eq!(cfg.mongo_address_csv, "localhost:27017");
        assert_eq!(cfg.mongo_auth_db_name, "admin");
        assert_eq!(cfg.mongo_session_cache_size, 1);
        assert_eq!(cfg.database_connect_timeout_secs, 300);

        let mut cfg = base();
        cfg.mongo_session_cache_size = 0;
        cfg.validate().unwrap();
        assert_eq!(cfg.mongo_session_cache_size, 1);

        let mut cfg = base();
        cfg.mongo_password = "secret".to_string();
        assert!(cfg.validate().is_err());
        cfg.mongo_username = "sync".to_string();
        assert!(cfg.validate().is_ok());

        let mut cfg = base();
        cfg.mongo_address_csv = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.database_connect_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use rill_api::ResetPolicy;

use crate::error::ConfigError;

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_request_batch() -> u64 {
    64
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

/// Kafka storage plugin configuration.
///
/// Arrives as JSON through `StorageFactory::create`, or as a TOML table
/// from a service config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaStorageConfig {
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,

    #[serde(default)]
    pub client_id: Option<String>,

    /// Upper bound on how long the fetch loop blocks in one poll, and so on
    /// how long a pause/resume/seek command waits before it is executed.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Demand a partition stream requests on its own when the caller reads
    /// with no outstanding demand. 0 = the caller requests explicitly.
    #[serde(default = "default_request_batch")]
    pub request_batch: u64,

    /// Producer delivery timeout for one publish.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Extra client properties passed through to the broker client as-is.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl KafkaStorageConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            request_batch: default_request_batch(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            properties: BTreeMap::new(),
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML config.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.split(',').all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("bootstrap_servers is empty".into()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid("poll_timeout_ms must be positive".into()));
        }
        if self.delivery_timeout_ms == 0 {
            return Err(ConfigError::Invalid("delivery_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Settings of one consumer-group session on `topic`.
    pub fn consumer_settings(
        &self,
        topic: &str,
        group: &str,
        reset: Option<ResetPolicy>,
    ) -> ConsumerSettings {
        ConsumerSettings {
            bootstrap_servers: self.bootstrap_servers.clone(),
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            reset,
            properties: self.properties.clone(),
        }
    }

    /// Client properties for the producer.
    pub fn producer_properties(&self) -> BTreeMap<String, String> {
        let mut props = self.properties.clone();
        props.insert("bootstrap.servers".into(), self.bootstrap_servers.clone());
        if let Some(client_id) = &self.client_id {
            props.insert("client.id".into(), client_id.clone());
        }
        props.insert("message.timeout.ms".into(), self.delivery_timeout_ms.to_string());
        props
    }
}

/// Everything a broker client needs to join a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub bootstrap_servers: String,
    pub client_id: Option<String>,
    pub topic: String,
    pub group: String,
    /// Applied by the broker only when the group has no committed position.
    pub reset: Option<ResetPolicy>,
    pub properties: BTreeMap<String, String>,
}

impl ConsumerSettings {
    /// Concrete client properties.
    ///
    /// Offsets are never committed or stored by the client: positions are
    /// recorded by an external collaborator. Pass-through properties cannot
    /// override that.
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = self.properties.clone();
        props.insert("bootstrap.servers".into(), self.bootstrap_servers.clone());
        props.insert("group.id".into(), self.group.clone());
        props.insert("enable.auto.commit".into(), "false".into());
        props.insert("enable.auto.offset.store".into(), "false".into());
        if let Some(client_id) = &self.client_id {
            props.insert("client.id".into(), client_id.clone());
        }
        match self.reset {
            Some(reset) => {
                props.insert("auto.offset.reset".into(), reset.as_str().into());
            }
            None => {
                props.remove("auto.offset.reset");
            }
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults() {
        let config = KafkaStorageConfig::from_json_str(r#"{"bootstrap_servers":"k1:9092"}"#).unwrap();
        assert_eq!(config, KafkaStorageConfig::new("k1:9092"));
        assert_eq!(config.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.request_batch, 64);
    }

    #[test]
    fn toml_with_properties() {
        let config = KafkaStorageConfig::from_toml_str(
            r#"
            bootstrap_servers = "k1:9092,k2:9092"
            client_id = "orders-reader"
            request_batch = 0

            [properties]
            "fetch.max.bytes" = "1048576"
            "#,
        )
        .unwrap();
        assert_eq!(config.request_batch, 0);
        assert_eq!(config.client_id.as_deref(), Some("orders-reader"));
        assert_eq!(config.properties.get("fetch.max.bytes").map(String::as_str), Some("1048576"));
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            KafkaStorageConfig::from_json_str(r#"{"bootstrap_servers":" , "}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            KafkaStorageConfig::from_json_str(r#"{"bootstrap_servers":"k:1","poll_timeout_ms":0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            KafkaStorageConfig::from_json_str(r#"{"bootstrap_servers":"k:1","bogus":true}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(KafkaStorageConfig::from_json_str("{}"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn consumer_properties_enforce_manual_commit() {
        let mut config = KafkaStorageConfig::new("k1:9092");
        config.properties.insert("enable.auto.commit".into(), "true".into());
        config.properties.insert("auto.offset.reset".into(), "latest".into());
        config.properties.insert("session.timeout.ms".into(), "6000".into());

        let props = config.consumer_settings("orders", "g1", None).client_properties();
        assert_eq!(props["group.id"], "g1");
        assert_eq!(props["bootstrap.servers"], "k1:9092");
        assert_eq!(props["enable.auto.commit"], "false");
        assert_eq!(props["enable.auto.offset.store"], "false");
        assert_eq!(props["session.timeout.ms"], "6000");
        assert!(!props.contains_key("auto.offset.reset"));

        let props = config
            .consumer_settings("orders", "g1", Some(ResetPolicy::Earliest))
            .client_properties();
        assert_eq!(props["auto.offset.reset"], "earliest");
    }

    #[test]
    fn producer_properties_carry_delivery_timeout() {
        let mut config = KafkaStorageConfig::new("k1:9092");
        config.delivery_timeout_ms = 5_000;
        let props = config.producer_properties();
        assert_eq!(props["message.timeout.ms"], "5000");
        assert!(!props.contains_key("group.id"));
    }
}

use rill_api::{ErrorKind, StorageError};

/// Failure reported by the broker client or by the fetch loop that drives it.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker client: {0}")]
    Client(String),

    #[error("fetch loop has shut down")]
    SessionClosed,

    #[error("partition {0} is not assigned to this session")]
    NotAssigned(i32),

    #[error("consumer group rebalance: {0}")]
    Rebalance(String),

    #[cfg(feature = "rdkafka")]
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl BrokerError {
    /// Convert to StorageError of the given kind, keeping this error as the cause.
    pub fn into_storage_error(self, kind: ErrorKind) -> StorageError {
        StorageError::new(kind, self.to_string()).with_source(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for StorageError {
    fn from(e: ConfigError) -> Self {
        StorageError::config(e.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT transport disconnected: {0}")]
    TransportDisconnected(#[from] rumqttc::ConnectionError),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Delivery to consumer {id} failed: {reason}")]
    ConsumerDelivery { id: u64, reason: String },

    #[error("Connection registry is closed")]
    RegistryClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Errors that only cost the offending message, never the pipeline.
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            Error::UnknownTopic(_) | Error::MalformedPayload(_) | Error::MissingField(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

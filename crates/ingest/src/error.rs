use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid mqtt configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

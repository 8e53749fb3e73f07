use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcpError {
    #[error("invalid tcp configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] gridpulse_store::StoreError),
}

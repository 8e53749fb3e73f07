use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongo is not configured (MONGO_DB_URI is empty)")]
    NotConfigured,

    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("bson conversion error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),
}

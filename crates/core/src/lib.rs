pub mod config;
pub mod error;
pub mod generator;
pub mod message;
pub mod normalize;
pub mod topics;
pub mod validate;

pub use config::Config;
pub use error::*;
pub use message::{normalize_timestamp, CanonicalMessage};
pub use normalize::{coerce_number, normalize_keys, round3};
pub use topics::collections_for_topic;
pub use validate::validate_message;

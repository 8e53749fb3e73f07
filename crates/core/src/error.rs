use thiserror::Error;

/// A message failed envelope or payload validation and must be dropped.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("topic is required")]
    MissingTopic,

    #[error("timestamp is required")]
    MissingTimestamp,

    #[error("payload must be a mapping")]
    PayloadNotMapping,

    #[error("device_id is required")]
    MissingDeviceId,

    #[error("payload.{0} is required")]
    MissingPayloadField(String),
}

pub mod batcher;
pub mod error;
pub mod indexes;
pub mod solar;
pub mod store;

pub use batcher::{SolarBatchHandle, SolarBatchWriter, SolarBatcher, WriterMetrics};
pub use error::StoreError;
pub use solar::SolarDocument;
pub use store::{AggregateDoc, SourceDoc, TelemetryStore};

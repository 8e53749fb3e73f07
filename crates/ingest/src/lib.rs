pub mod assembler;
pub mod client;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod subscriber;
pub mod worker;

pub use assembler::PacketAssembler;
pub use envelope::{IngestQueue, MessageEnvelope};
pub use error::IngestError;
pub use metrics::IngestMetrics;
pub use worker::IngestWorker;

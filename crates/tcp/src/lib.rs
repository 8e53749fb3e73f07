pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;

pub use error::TcpError;
pub use metrics::TcpMetrics;
pub use protocol::{decode_response, DecodeError, ResponseCycle, HEARTBEAT_PACKET, RESPONSE_PACKETS};
pub use server::{SolarCommitter, SolarPipeline, TcpTelemetryServer};

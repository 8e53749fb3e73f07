//! Solar telemetry document committed by the TCP server.

use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use serde::{Deserialize, Serialize};

/// One completed three-phase readout from a solar gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolarDocument {
    pub timestamp: DateTime<Utc>,
    /// `ip:port` of the reporting gateway connection.
    pub client_id: String,
    pub current: Vec<f64>,
    pub power: Vec<f64>,
    pub energy_consumption: Vec<f64>,
}

impl SolarDocument {
    pub fn to_document(&self) -> Document {
        doc! {
            "timestamp": BsonDateTime::from_millis(self.timestamp.timestamp_millis()),
            "client_id": &self.client_id,
            "current": self.current.clone(),
            "power": self.power.clone(),
            "energy_consumption": self.energy_consumption.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_document_fields() {
        let solar = SolarDocument {
            timestamp: Utc::now(),
            client_id: "10.0.0.1:5001".to_string(),
            current: vec![1.0, 2.0],
            power: vec![3.0],
            energy_consumption: vec![10.0, 20.0],
        };
        let document = solar.to_document();
        assert_eq!(document.get_str("client_id").unwrap(), "10.0.0.1:5001");
        assert_eq!(document.get_array("current").unwrap().len(), 2);
        assert!(document.get_datetime("timestamp").is_ok());
    }
}

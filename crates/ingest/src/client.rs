//! MQTT client option building.

use std::time::Duration;

use rumqttc::{MqttOptions, QoS, Transport};
use tracing::warn;

use gridpulse_core::config::MqttConfig;

use crate::error::IngestError;

/// Build broker connection options from config.
///
/// TLS material is read up front so bad paths fail startup rather than the
/// first reconnect.
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, IngestError> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    options.set_clean_session(config.clean_session);
    options.set_inflight(config.max_inflight);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or(""));
    }

    if config.protocol.trim() == "5" {
        // The v5 event loop is a separate client type; subscriptions here are
        // plain topic filters, so 3.1.1 carries them identically.
        warn!("MQTT_PROTOCOL=5 requested; connecting with 3.1.1");
    }

    if config.tls.enabled {
        let ca = match &config.tls.ca_certs {
            Some(path) => std::fs::read(path)?,
            None => {
                return Err(IngestError::Config(
                    "MQTT_TLS requires MQTT_CA_CERTS".to_string(),
                ))
            }
        };
        let client_auth = match (&config.tls.certfile, &config.tls.keyfile) {
            (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
            (None, None) => None,
            _ => {
                return Err(IngestError::Config(
                    "MQTT_CERTFILE and MQTT_KEYFILE must be set together".to_string(),
                ))
            }
        };
        if config.tls.insecure {
            warn!("MQTT_TLS_INSECURE is not supported with the rustls transport; verifying");
        }
        options.set_transport(Transport::tls(ca, client_auth, None));
    }

    Ok(options)
}

/// Map a configured QoS number to the protocol QoS, defaulting to 0.
pub fn qos_level(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

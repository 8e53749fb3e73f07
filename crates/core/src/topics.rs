//! Topic taxonomy and collection routing.

/// Grid meter realtime samples.
pub const RT_DATA: &str = "MQTT_RT_DATA";
/// Grid meter cumulative energy counters.
pub const ENY_NOW: &str = "MQTT_ENY_NOW";
/// Grid meter daily summaries.
pub const DAY_DATA: &str = "MQTT_DAY_DATA";
/// Grid meter frozen energy registers.
pub const ENY_FRZ: &str = "MQTT_ENY_FRZ";
/// Purbachal environment sensor.
pub const ENV_01: &str = "CCCL/PURBACHAL/ENV_01";
/// Purbachal generator meter.
pub const ENM_01: &str = "CCCL/PURBACHAL/ENM_01";
/// Pseudo-topic for documents committed by the TCP solar server.
pub const TCP_SOLAR: &str = "TCP_SOLAR_DATA";

/// Map a topic to the collections its documents are written into.
///
/// Every message is additionally mirrored to `telemetry_events`; that mirror
/// is handled by the store, not listed here. `MQTT_ENY_NOW` lands in its
/// `today` tier at ingest time because the device cadence is slower than the
/// one-minute aggregation window.
pub fn collections_for_topic<'a>(topic: &str, fallback: &'a str) -> Vec<&'a str> {
    match topic {
        RT_DATA => vec!["grid_rt_data"],
        ENY_NOW => vec!["grid_eny_now_data", "today_grid_eny_now_data"],
        DAY_DATA => vec!["grid_day_data"],
        ENY_FRZ => vec!["grid_eny_frz_data"],
        ENV_01 => vec!["environment_data"],
        ENM_01 => vec!["generator_data"],
        _ => vec![fallback],
    }
}

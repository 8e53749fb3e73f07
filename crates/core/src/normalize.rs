//! Payload field-name canonicalisation and numeric coercion.

use serde_json::{Map, Value};

/// Canonicalise every key of a payload mapping.
///
/// Lowercases, trims, and applies the device-vendor replacement table:
/// `(`→`_`, `)`→``, `/`→`_`, `%`→`percent`, `*`→``, `+`→`plus`,
/// `-`→`minus`, space→`_`; repeated `_` collapse to one. Values are left
/// untouched. Applying the function twice yields the same result.
pub fn normalize_keys(payload: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::with_capacity(payload.len());
    for (key, value) in payload {
        normalized.insert(normalize_key(key), value.clone());
    }
    normalized
}

fn normalize_key(key: &str) -> String {
    let mut out = key
        .trim()
        .replace('(', "_")
        .replace(')', "")
        .replace('/', "_")
        .replace('%', "percent")
        .replace('*', "")
        .replace('+', "plus")
        .replace('-', "minus")
        .replace(' ', "_")
        .to_lowercase();
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out
}

/// Coerce a JSON value to f64 for aggregation.
///
/// Accepts numbers and decimal strings; everything else is skipped.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Round half-away-from-zero to three decimal places.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

use crate::types::{PipelineError, Result};

pub const HOUR_SECONDS: u64 = 3600;

/// Parse a hex-encoded unsigned integer field ("0x..." prefix optional).
pub fn decode_hex(field: &str) -> Result<u128> {
    let digits = field.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Err(PipelineError::Decode(format!("empty hex field '{field}'")));
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| PipelineError::Decode(format!("bad hex field '{field}': {e}")))
}

/// Utilization in percent; undefined (not zero) when nothing is supplied.
pub fn calculate_utilization(debt: f64, supplied: f64) -> Option<f64> {
    if supplied == 0.0 {
        None
    } else {
        Some((debt / supplied) * 100.0)
    }
}

/// Convert a per-second compounding rate into its annual equivalent.
pub fn annualize_rate(per_second: f64, seconds_per_year: f64) -> f64 {
    (1.0 + per_second).powf(seconds_per_year) - 1.0
}

/// Hour bucket index of a unix timestamp.
pub fn hour_bucket(timestamp: u64) -> u64 {
    timestamp / HOUR_SECONDS
}

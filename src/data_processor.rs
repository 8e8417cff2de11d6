use std::collections::BTreeMap;

use log::info;

use crate::types::{AssetConfig, Observation, ProtocolParams};
use crate::utils::{annualize_rate, calculate_utilization};

/// An `AssetConfig` with every fixed-point field converted to a decimal value.
/// Reserves divide by the asset's own scale; everything else by the protocol
/// scale. Precision loss from the float division is accepted (analytics, not
/// settlement).
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub market: String,
    pub timestamp: u64,
    pub debt_dec: f64,
    pub reserve_dec: f64,
    pub accumulator_dec: f64,
    pub full_rate_dec: f64,
    pub price_dec: Option<f64>,
}

pub fn normalize(market: &str, config: &AssetConfig, params: &ProtocolParams) -> NormalizedRecord {
    NormalizedRecord {
        market: market.to_string(),
        timestamp: config.last_updated,
        debt_dec: config.total_nominal_debt as f64 / params.scale,
        reserve_dec: config.reserve as f64 / config.scale as f64,
        accumulator_dec: config.last_rate_accumulator as f64 / params.scale,
        full_rate_dec: annualize_rate(
            config.last_full_utilization_rate as f64 / params.scale,
            params.seconds_per_year,
        ),
        price_dec: config.collateral_asset_price.map(|p| p as f64 / params.scale),
    }
}

/// Derive one `Observation` per record. The borrow rate comes from the growth
/// of the rate accumulator between consecutive observations of the same
/// market, so each market is folded separately over its time-ordered records
/// carrying `(prev_timestamp, prev_accumulator)`. The first observation of a
/// market, and any zero time delta, leave the rate undefined.
pub fn derive_observations(
    records: Vec<NormalizedRecord>,
    params: &ProtocolParams,
) -> Vec<Observation> {
    let mut by_market: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();
    for record in records {
        by_market.entry(record.market.clone()).or_default().push(record);
    }

    let mut observations = Vec::new();
    for (market, mut market_records) in by_market {
        market_records.sort_by_key(|r| r.timestamp);
        let mut prev: Option<(u64, f64)> = None;
        for record in market_records {
            let debt = record.debt_dec * record.accumulator_dec;
            let supplied = debt + record.reserve_dec;
            let debt_usd = record.price_dec.map(|price| debt * price);
            let supplied_usd = record.price_dec.map(|price| supplied * price);

            let borrow_rate = prev.and_then(|(prev_ts, prev_acc)| {
                let time_diff = record.timestamp.saturating_sub(prev_ts);
                if time_diff == 0 || prev_acc == 0.0 {
                    return None;
                }
                let rate_grow = record.accumulator_dec / prev_acc;
                let exponent = params.seconds_per_year / time_diff as f64;
                Some((rate_grow.powf(exponent) - 1.0) * 100.0)
            });
            prev = Some((record.timestamp, record.accumulator_dec));

            observations.push(Observation {
                market: market.clone(),
                timestamp: record.timestamp,
                debt,
                supplied,
                debt_usd,
                supplied_usd,
                utilization: calculate_utilization(debt, supplied),
                borrow_rate,
                full_rate: record.full_rate_dec * 100.0,
            });
        }
    }
    info!("[DataProcessor] derived {} observations", observations.len());
    observations
}

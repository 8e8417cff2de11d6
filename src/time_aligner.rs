use std::collections::BTreeMap;

use crate::types::Observation;
use crate::utils::{calculate_utilization, hour_bucket};

/// Hourly USD magnitudes per market (bucket means).
#[derive(Debug, Clone, PartialEq)]
pub struct MarketHourRow {
    pub market: String,
    pub hour: u64,
    pub debt_usd: Option<f64>,
    pub supplied_usd: Option<f64>,
}

/// Hourly rate readings per market (bucket maxima, the peak reading).
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRateRow {
    pub market: String,
    pub hour: u64,
    pub borrow_rate: Option<f64>,
    pub utilization: Option<f64>,
}

/// Protocol-wide hourly totals with blended utilization.
#[derive(Debug, Clone, PartialEq)]
pub struct TotalHourRow {
    pub hour: u64,
    pub debt_usd: f64,
    pub supplied_usd: f64,
    pub utilization: Option<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn group_by_market_hour(
    observations: &[Observation],
) -> BTreeMap<&str, BTreeMap<u64, Vec<&Observation>>> {
    let mut grouped: BTreeMap<&str, BTreeMap<u64, Vec<&Observation>>> = BTreeMap::new();
    for obs in observations {
        grouped
            .entry(obs.market.as_str())
            .or_default()
            .entry(hour_bucket(obs.timestamp))
            .or_default()
            .push(obs);
    }
    grouped
}

/// Walk a market's hour span, aggregating each occupied bucket with
/// `aggregate` and forward-filling the two columns independently. Empty
/// buckets take the last defined value; leading gaps stay undefined (state
/// persists forward, never backward).
fn align_market<F>(buckets: &BTreeMap<u64, Vec<&Observation>>, aggregate: F) -> Vec<(u64, Option<f64>, Option<f64>)>
where
    F: Fn(&[&Observation]) -> (Option<f64>, Option<f64>),
{
    let (Some(&first), Some(&last)) = (
        buckets.keys().next(),
        buckets.keys().next_back(),
    ) else {
        return Vec::new();
    };

    let mut rows = Vec::with_capacity((last - first + 1) as usize);
    let mut carried: (Option<f64>, Option<f64>) = (None, None);
    for hour in first..=last {
        let bucketed = match buckets.get(&hour) {
            Some(observations) => aggregate(observations),
            None => (None, None),
        };
        let left = bucketed.0.or(carried.0);
        let right = bucketed.1.or(carried.1);
        carried = (left, right);
        rows.push((hour, left, right));
    }
    rows
}

/// Hourly means of the USD magnitude series, forward-filled per market.
pub fn align_magnitudes(observations: &[Observation]) -> Vec<MarketHourRow> {
    let mut rows = Vec::new();
    for (market, buckets) in group_by_market_hour(observations) {
        let aligned = align_market(&buckets, |bucket| {
            let debt: Vec<f64> = bucket.iter().filter_map(|o| o.debt_usd).collect();
            let supplied: Vec<f64> = bucket.iter().filter_map(|o| o.supplied_usd).collect();
            (mean(&debt), mean(&supplied))
        });
        rows.extend(aligned.into_iter().map(|(hour, debt_usd, supplied_usd)| {
            MarketHourRow {
                market: market.to_string(),
                hour,
                debt_usd,
                supplied_usd,
            }
        }));
    }
    rows
}

/// Hourly maxima of the rate series, forward-filled per market.
pub fn align_rates(observations: &[Observation]) -> Vec<MarketRateRow> {
    let mut rows = Vec::new();
    for (market, buckets) in group_by_market_hour(observations) {
        let aligned = align_market(&buckets, |bucket| {
            let rates: Vec<f64> = bucket.iter().filter_map(|o| o.borrow_rate).collect();
            let utilizations: Vec<f64> = bucket.iter().filter_map(|o| o.utilization).collect();
            (max(&rates), max(&utilizations))
        });
        rows.extend(aligned.into_iter().map(|(hour, borrow_rate, utilization)| {
            MarketRateRow {
                market: market.to_string(),
                hour,
                borrow_rate,
                utilization,
            }
        }));
    }
    rows
}

/// Sum USD magnitudes across markets per hour and recompute utilization from
/// the summed totals. A weighted aggregate, deliberately not an average of
/// per-market utilizations.
pub fn aggregate_totals(rows: &[MarketHourRow]) -> Vec<TotalHourRow> {
    let mut per_hour: BTreeMap<u64, (f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = per_hour.entry(row.hour).or_insert((0.0, 0.0));
        if let Some(debt) = row.debt_usd {
            entry.0 += debt;
        }
        if let Some(supplied) = row.supplied_usd {
            entry.1 += supplied;
        }
    }
    per_hour
        .into_iter()
        .map(|(hour, (debt_usd, supplied_usd))| TotalHourRow {
            hour,
            debt_usd,
            supplied_usd,
            utilization: calculate_utilization(debt_usd, supplied_usd),
        })
        .collect()
}

/// The hour window that survives trimming `trim_start` buckets from the head
/// of the sample and `trim_end` from the tail. `None` when nothing survives.
pub fn trim_window(
    hours: impl IntoIterator<Item = u64>,
    trim_start: u64,
    trim_end: u64,
) -> Option<(u64, u64)> {
    let mut min = None;
    let mut max = None;
    for hour in hours {
        min = Some(min.map_or(hour, |m: u64| m.min(hour)));
        max = Some(max.map_or(hour, |m: u64| m.max(hour)));
    }
    let (min, max) = (min?, max?);
    let low = min + trim_start;
    let high = max.checked_sub(trim_end)?;
    if low > high {
        None
    } else {
        Some((low, high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(market: &str, timestamp: u64, debt_usd: f64, supplied_usd: f64) -> Observation {
        Observation {
            market: market.into(),
            timestamp,
            debt: debt_usd,
            supplied: supplied_usd,
            debt_usd: Some(debt_usd),
            supplied_usd: Some(supplied_usd),
            utilization: calculate_utilization(debt_usd, supplied_usd),
            borrow_rate: Some(5.0),
            full_rate: 0.0,
        }
    }

    #[test]
    fn gaps_forward_fill_from_the_last_bucket() {
        // Hours 0 and 3 observed; 1 and 2 must carry hour 0's value.
        let rows = align_magnitudes(&[obs("ETH", 0, 10.0, 20.0), obs("ETH", 3 * 3600, 40.0, 80.0)]);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1].debt_usd, Some(10.0));
        assert_eq!(rows[2].supplied_usd, Some(20.0));
        assert_eq!(rows[3].debt_usd, Some(40.0));
    }

    #[test]
    fn aligning_an_aligned_series_is_identity() {
        let observations = vec![
            obs("ETH", 0, 10.0, 20.0),
            obs("ETH", 3600, 12.0, 24.0),
            obs("ETH", 7200, 14.0, 28.0),
        ];
        let once = align_magnitudes(&observations);
        // Rebuild observations sitting exactly on the hourly grid.
        let again: Vec<Observation> = once
            .iter()
            .map(|row| {
                obs(
                    &row.market,
                    row.hour * 3600,
                    row.debt_usd.unwrap(),
                    row.supplied_usd.unwrap(),
                )
            })
            .collect();
        assert_eq!(align_magnitudes(&again), once);
    }

    #[test]
    fn bucket_mean_for_magnitudes() {
        let rows = align_magnitudes(&[obs("ETH", 0, 10.0, 20.0), obs("ETH", 60, 30.0, 40.0)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].debt_usd, Some(20.0));
        assert_eq!(rows[0].supplied_usd, Some(30.0));
    }

    #[test]
    fn bucket_max_for_rates() {
        let mut low = obs("ETH", 0, 10.0, 100.0); // utilization 10
        low.borrow_rate = Some(1.0);
        let mut high = obs("ETH", 60, 40.0, 100.0); // utilization 40
        high.borrow_rate = Some(3.0);
        let rows = align_rates(&[low, high]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].borrow_rate, Some(3.0));
        assert_eq!(rows[0].utilization, Some(40.0));
    }

    #[test]
    fn undefined_rates_do_not_poison_the_bucket_max() {
        let mut first = obs("ETH", 0, 10.0, 100.0);
        first.borrow_rate = None;
        let mut second = obs("ETH", 60, 10.0, 100.0);
        second.borrow_rate = Some(2.5);
        let rows = align_rates(&[first, second]);
        assert_eq!(rows[0].borrow_rate, Some(2.5));
    }

    #[test]
    fn aggregate_utilization_is_blended_not_averaged() {
        // A: 100/200 (50%), B: 300/300 (100%). Blended: 400/500 = 80%, not 75%.
        let rows = align_magnitudes(&[obs("A", 0, 100.0, 200.0), obs("B", 0, 300.0, 300.0)]);
        let totals = aggregate_totals(&rows);
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].debt_usd, 400.0);
        assert_eq!(totals[0].supplied_usd, 500.0);
        assert!((totals[0].utilization.unwrap() - 80.0).abs() < 1e-12);
    }

    #[test]
    fn aggregate_utilization_undefined_with_zero_supply() {
        let rows = align_magnitudes(&[obs("A", 0, 0.0, 0.0)]);
        let totals = aggregate_totals(&rows);
        assert_eq!(totals[0].utilization, None);
    }

    #[test]
    fn markets_span_independent_windows() {
        // ETH covers hours 0..=2, USDC only hour 5: no cross-market fill.
        let rows = align_magnitudes(&[
            obs("ETH", 0, 1.0, 2.0),
            obs("ETH", 2 * 3600, 1.0, 2.0),
            obs("USDC", 5 * 3600, 9.0, 9.0),
        ]);
        let usdc: Vec<_> = rows.iter().filter(|r| r.market == "USDC").collect();
        assert_eq!(usdc.len(), 1);
        assert_eq!(usdc[0].hour, 5);
    }

    #[test]
    fn trim_removes_head_and_tail_buckets() {
        let window = trim_window(0..=10, 5, 1).unwrap();
        assert_eq!(window, (5, 9));
        assert_eq!(trim_window(0..=3, 5, 1), None);
        assert_eq!(trim_window(std::iter::empty::<u64>(), 5, 1), None);
    }
}

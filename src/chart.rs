use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;

use crate::time_aligner::{MarketHourRow, MarketRateRow, TotalHourRow};
use crate::types::Result;
use crate::utils::HOUR_SECONDS;

/// Final table one chart consumes. `columns` names the value columns; each row
/// is one hour bucket with one optional value per column (undefined metrics
/// stay empty all the way into the artifact).
#[derive(Debug, Clone, PartialEq)]
pub struct ChartData {
    pub label: String,
    pub columns: Vec<String>,
    pub rows: Vec<ChartRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartRow {
    pub hour: u64,
    pub values: Vec<Option<f64>>,
}

impl ChartData {
    pub fn start_hour(&self) -> Option<u64> {
        self.rows.first().map(|r| r.hour)
    }

    pub fn end_hour(&self) -> Option<u64> {
        self.rows.last().map(|r| r.hour)
    }
}

fn bucket_datetime(hour: u64) -> DateTime<Utc> {
    DateTime::from_timestamp((hour * HOUR_SECONDS) as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Artifact naming contract: `<start-date>_<end-date>_<label>.png`.
pub fn artifact_filename(start_hour: u64, end_hour: u64, label: &str) -> String {
    format!(
        "{}_{}_{}.png",
        bucket_datetime(start_hour).format("%Y-%m-%d"),
        bucket_datetime(end_hour).format("%Y-%m-%d"),
        label
    )
}

/// Supplied, debt and blended utilization for the whole protocol.
pub fn total_chart(totals: &[TotalHourRow]) -> ChartData {
    ChartData {
        label: "total".into(),
        columns: vec!["supplied_usd".into(), "debt_usd".into(), "utilization".into()],
        rows: totals
            .iter()
            .map(|row| ChartRow {
                hour: row.hour,
                values: vec![Some(row.supplied_usd), Some(row.debt_usd), row.utilization],
            })
            .collect(),
    }
}

fn pivot<R>(
    rows: &[R],
    market_of: impl Fn(&R) -> &str,
    hour_of: impl Fn(&R) -> u64,
    value_of: impl Fn(&R) -> Option<f64>,
) -> (Vec<String>, BTreeMap<u64, BTreeMap<String, Option<f64>>>) {
    let mut markets: Vec<String> = rows.iter().map(|r| market_of(r).to_string()).collect();
    markets.sort();
    markets.dedup();

    let mut table: BTreeMap<u64, BTreeMap<String, Option<f64>>> = BTreeMap::new();
    for row in rows {
        table
            .entry(hour_of(row))
            .or_default()
            .insert(market_of(row).to_string(), value_of(row));
    }
    (markets, table)
}

fn pivot_chart<R>(
    label: &str,
    rows: &[R],
    market_of: impl Fn(&R) -> &str,
    hour_of: impl Fn(&R) -> u64,
    value_of: impl Fn(&R) -> Option<f64>,
) -> ChartData {
    let (markets, table) = pivot(rows, market_of, hour_of, value_of);
    ChartData {
        label: label.into(),
        rows: table
            .into_iter()
            .map(|(hour, cells)| ChartRow {
                hour,
                values: markets
                    .iter()
                    .map(|market| cells.get(market).copied().flatten())
                    .collect(),
            })
            .collect(),
        columns: markets,
    }
}

/// Each market's share of the hourly summed supplied USD.
pub fn market_share_chart(rows: &[MarketHourRow]) -> ChartData {
    let mut hourly_total: BTreeMap<u64, f64> = BTreeMap::new();
    for row in rows {
        if let Some(supplied) = row.supplied_usd {
            *hourly_total.entry(row.hour).or_insert(0.0) += supplied;
        }
    }
    pivot_chart(
        "market-share",
        rows,
        |r| r.market.as_str(),
        |r| r.hour,
        |r| {
            let total = hourly_total.get(&r.hour).copied().unwrap_or(0.0);
            match r.supplied_usd {
                Some(supplied) if total > 0.0 => Some(supplied / total),
                _ => None,
            }
        },
    )
}

/// Per-market utilization columns (hourly maxima).
pub fn utilization_chart(rows: &[MarketRateRow]) -> ChartData {
    pivot_chart(
        "utilization",
        rows,
        |r| r.market.as_str(),
        |r| r.hour,
        |r| r.utilization,
    )
}

/// Per-market borrow APR columns (hourly maxima).
pub fn rates_chart(rows: &[MarketRateRow]) -> ChartData {
    pivot_chart(
        "rates",
        rows,
        |r| r.market.as_str(),
        |r| r.hour,
        |r| r.borrow_rate,
    )
}

/// Borrow APR and utilization for a single market.
pub fn market_detail_chart(market: &str, rows: &[MarketRateRow]) -> ChartData {
    ChartData {
        label: market.into(),
        columns: vec!["borrow_rate".into(), "utilization".into()],
        rows: rows
            .iter()
            .filter(|r| r.market == market)
            .map(|r| ChartRow {
                hour: r.hour,
                values: vec![r.borrow_rate, r.utilization],
            })
            .collect(),
    }
}

/// Image rendering is an external collaborator; implementations consume the
/// assembled table and produce one artifact per chart. An empty chart yields
/// `None` rather than a path.
pub trait ChartRenderer {
    fn render(&self, chart: &ChartData) -> Result<Option<PathBuf>>;
}

/// Writes each chart's input table as CSV, next to where the image backend
/// drops its PNG (same basename, `.csv` extension).
pub struct CsvChartWriter {
    out_dir: PathBuf,
}

impl CsvChartWriter {
    pub fn new(out_dir: impl AsRef<Path>) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
        }
    }
}

impl ChartRenderer for CsvChartWriter {
    fn render(&self, chart: &ChartData) -> Result<Option<PathBuf>> {
        let (Some(start), Some(end)) = (chart.start_hour(), chart.end_hour()) else {
            info!("[CsvChartWriter] skipping empty chart '{}'", chart.label);
            return Ok(None);
        };
        let name = artifact_filename(start, end, &chart.label);
        let path = self.out_dir.join(name).with_extension("csv");

        let mut writer = csv::Writer::from_path(&path)?;
        let mut header = vec!["date".to_string()];
        header.extend(chart.columns.iter().cloned());
        writer.write_record(&header)?;
        for row in &chart.rows {
            let mut record = vec![bucket_datetime(row.hour)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()];
            record.extend(
                row.values
                    .iter()
                    .map(|v| v.map(|x| x.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        info!(
            "[CsvChartWriter] wrote chart input '{}' to {}",
            chart.label,
            path.display()
        );
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour_row(market: &str, hour: u64, supplied: f64) -> MarketHourRow {
        MarketHourRow {
            market: market.into(),
            hour,
            debt_usd: Some(supplied / 2.0),
            supplied_usd: Some(supplied),
        }
    }

    #[test]
    fn filenames_follow_the_date_label_convention() {
        // Hour 480_000 is 1_728_000_000s, i.e. 2024-10-04 00:00 UTC.
        assert_eq!(artifact_filename(0, 0, "total"), "1970-01-01_1970-01-01_total.png");
        let name = artifact_filename(480_000, 480_024, "market-share");
        assert_eq!(name, "2024-10-04_2024-10-05_market-share.png");
    }

    #[test]
    fn market_shares_sum_to_one_per_hour() {
        let chart = market_share_chart(&[
            hour_row("ETH", 0, 300.0),
            hour_row("USDC", 0, 100.0),
            hour_row("ETH", 1, 50.0),
        ]);
        assert_eq!(chart.columns, vec!["ETH", "USDC"]);
        let first: f64 = chart.rows[0].values.iter().flatten().sum();
        assert!((first - 1.0).abs() < 1e-12);
        assert_eq!(chart.rows[0].values[0], Some(0.75));
        // USDC has no row at hour 1: empty cell, not zero.
        assert_eq!(chart.rows[1].values, vec![Some(1.0), None]);
    }

    #[test]
    fn detail_chart_keeps_only_its_market() {
        let rows = vec![
            MarketRateRow {
                market: "ETH".into(),
                hour: 3,
                borrow_rate: Some(2.0),
                utilization: Some(40.0),
            },
            MarketRateRow {
                market: "USDC".into(),
                hour: 3,
                borrow_rate: Some(9.0),
                utilization: Some(90.0),
            },
        ];
        let chart = market_detail_chart("ETH", &rows);
        assert_eq!(chart.label, "ETH");
        assert_eq!(chart.rows.len(), 1);
        assert_eq!(chart.rows[0].values, vec![Some(2.0), Some(40.0)]);
    }

    #[test]
    fn csv_writer_emits_one_table_per_chart() {
        let dir = tempfile::tempdir().unwrap();
        let chart = total_chart(&[crate::time_aligner::TotalHourRow {
            hour: 480_000,
            debt_usd: 10.0,
            supplied_usd: 20.0,
            utilization: Some(50.0),
        }]);
        let path = CsvChartWriter::new(dir.path()).render(&chart).unwrap().unwrap();
        assert_eq!(path.extension().unwrap(), "csv");
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("date,supplied_usd,debt_usd,utilization"));
        assert!(body.contains(",20,10,50"));
    }

    #[test]
    fn empty_charts_produce_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let rendered = CsvChartWriter::new(dir.path()).render(&total_chart(&[])).unwrap();
        assert_eq!(rendered, None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn undefined_cells_are_empty_in_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let chart = total_chart(&[crate::time_aligner::TotalHourRow {
            hour: 1,
            debt_usd: 0.0,
            supplied_usd: 0.0,
            utilization: None,
        }]);
        let path = CsvChartWriter::new(dir.path()).render(&chart).unwrap().unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.lines().nth(1).unwrap().ends_with(",0,0,"));
    }
}

mod chart;
mod data_processor;
mod event_decoder;
mod event_source;
mod time_aligner;
mod types;
mod utils;

use log::{info, warn};

use crate::chart::ChartRenderer;
use crate::data_processor::{derive_observations, normalize};
use crate::event_decoder::{decode_batch, Layout};
use crate::event_source::{AlchemyTransport, EventFilter, EventSource, RpcLogSource, StoreSource};
use crate::time_aligner::{aggregate_totals, align_magnitudes, align_rates, trim_window};
use crate::types::{Config, ProtocolParams, Result, SourceKind};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    let params = ProtocolParams::vesu_mainnet();

    // Stage 1: fetch. A source failure aborts before anything is written.
    let raw_events = match config.source {
        SourceKind::Rpc => {
            let filter = EventFilter {
                from_block: config.from_block,
                address: config.contract_address.clone(),
                event_key: config.event_key.clone(),
                chunk_size: config.chunk_size,
            };
            let transport = AlchemyTransport::new(&config.rpc_endpoint);
            RpcLogSource::new(transport, filter, config.start_token.clone())
                .fetch_events()
                .await?
        }
        SourceKind::Store => {
            StoreSource::new(&config.store_path, config.window_start, config.window_end)
                .fetch_events()
                .await?
        }
    };

    // Stage 2: decode and join against the market catalog.
    let layout = if config.legacy_layout {
        Layout::Legacy
    } else {
        Layout::Current
    };
    let decoded = decode_batch(&raw_events, layout, &params.catalog);
    info!(
        "[main] decoded {} of {} raw events",
        decoded.len(),
        raw_events.len()
    );

    // Stage 3: normalize scales and derive per-market metrics.
    let normalized = decoded
        .iter()
        .map(|(market, asset_config)| normalize(market, asset_config, &params))
        .collect();
    let observations = derive_observations(normalized, &params);

    // Stage 4: align onto the hourly grid and aggregate across markets.
    let magnitudes = align_magnitudes(&observations);
    let rates = align_rates(&observations);
    let totals = aggregate_totals(&magnitudes);

    let Some((low, high)) = trim_window(
        totals.iter().map(|t| t.hour),
        config.trim_start_hours,
        config.trim_end_hours,
    ) else {
        warn!("[main] sample too short after trimming; no charts written");
        return Ok(());
    };
    let magnitudes: Vec<_> = magnitudes
        .into_iter()
        .filter(|r| (low..=high).contains(&r.hour))
        .collect();
    let rates: Vec<_> = rates
        .into_iter()
        .filter(|r| (low..=high).contains(&r.hour))
        .collect();
    let totals: Vec<_> = totals
        .into_iter()
        .filter(|r| (low..=high).contains(&r.hour))
        .collect();

    // Stage 5: emit one chart input per artifact.
    let renderer = chart::CsvChartWriter::new(&config.out_dir);
    renderer.render(&chart::total_chart(&totals))?;
    renderer.render(&chart::market_share_chart(&magnitudes))?;
    renderer.render(&chart::utilization_chart(&rates))?;
    renderer.render(&chart::rates_chart(&rates))?;

    let mut markets: Vec<String> = rates.iter().map(|r| r.market.clone()).collect();
    markets.sort();
    markets.dedup();
    for market in &markets {
        renderer.render(&chart::market_detail_chart(market, &rates))?;
    }

    info!("[main] pipeline finished: {} markets charted", markets.len());
    Ok(())
}

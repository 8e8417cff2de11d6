use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;

use crate::event_decoder::Layout;
use crate::types::{PipelineError, RawEvent, Result};

/// A finite, ordered sequence of raw events. Both providers yield the same
/// field order, so the decoder never knows where a batch came from.
#[async_trait]
pub trait EventSource {
    async fn fetch_events(&self) -> Result<Vec<RawEvent>>;
}

/// Server-side filter for the paginated log query.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub from_block: u64,
    pub address: String,
    pub event_key: String,
    pub chunk_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub data: Vec<String>,
}

/// One page of the paginated log. A missing `continuation_token` terminates
/// the fetch.
#[derive(Debug, Deserialize)]
pub struct EventsPage {
    #[serde(default)]
    pub events: Vec<EventRecord>,
    pub continuation_token: Option<String>,
}

/// Transport seam for the remote log provider, mockable in tests.
#[async_trait]
pub trait EventTransport {
    async fn get_events(
        &self,
        filter: &EventFilter,
        continuation_token: Option<&str>,
    ) -> Result<EventsPage>;
}

/// JSON-RPC transport against the Alchemy Starknet endpoint.
pub struct AlchemyTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl AlchemyTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl EventTransport for AlchemyTransport {
    async fn get_events(
        &self,
        filter: &EventFilter,
        continuation_token: Option<&str>,
    ) -> Result<EventsPage> {
        let mut query = serde_json::json!({
            "from_block": { "block_number": filter.from_block },
            "to_block": "latest",
            "address": filter.address,
            "keys": [[filter.event_key]],
            "chunk_size": filter.chunk_size,
        });
        if let Some(token) = continuation_token {
            query["continuation_token"] = serde_json::Value::String(token.to_string());
        }
        let payload = serde_json::json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "starknet_getEvents",
            "params": [query],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("rpc request failed: {e}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("rpc response not json: {e}")))?;

        if let Some(error) = body.get("error") {
            return Err(PipelineError::SourceUnavailable(format!(
                "rpc error response: {error}"
            )));
        }
        let result = body.get("result").ok_or_else(|| {
            PipelineError::SourceUnavailable("rpc response missing 'result'".into())
        })?;
        serde_json::from_value(result.clone())
            .map_err(|e| PipelineError::SourceUnavailable(format!("malformed events page: {e}")))
    }
}

/// Remote-log source: repeats range queries from a fixed starting block,
/// following the continuation cursor until the provider stops returning one.
pub struct RpcLogSource<T: EventTransport> {
    transport: T,
    filter: EventFilter,
    start_token: Option<String>,
}

impl<T: EventTransport> RpcLogSource<T> {
    pub fn new(transport: T, filter: EventFilter, start_token: Option<String>) -> Self {
        Self {
            transport,
            filter,
            start_token,
        }
    }
}

#[async_trait]
impl<T: EventTransport + Send + Sync> EventSource for RpcLogSource<T> {
    async fn fetch_events(&self) -> Result<Vec<RawEvent>> {
        let mut raw_events = Vec::new();
        let mut token = self.start_token.clone();
        loop {
            debug!(
                "[RpcLogSource] fetching events page (token={})",
                token.as_deref().unwrap_or("<none>")
            );
            let page = self.transport.get_events(&self.filter, token.as_deref()).await?;
            for event in page.events {
                // Key fields first, then data fields, as the chain emits them.
                let mut fields = event.keys;
                fields.extend(event.data);
                raw_events.push(RawEvent { fields });
            }
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        info!("[RpcLogSource] fetched {} raw events", raw_events.len());
        Ok(raw_events)
    }
}

const STORE_QUERY: &str = "SELECT timestamp, collateralAsset, collateralAssetPrice, \
     collateral_reserve, collateral_total_nominal_debt, collateral_last_rate_accumulator, \
     collateralAssetScale \
     FROM update_context WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp";

/// Store-query source: one bulk read of previously indexed rows over a closed
/// time window. The connection lives only for the duration of that query.
pub struct StoreSource {
    path: PathBuf,
    window_start: u64,
    window_end: u64,
}

struct StoreRow {
    timestamp: i64,
    collateral_asset: String,
    collateral_asset_price: String,
    reserve: String,
    total_nominal_debt: String,
    last_rate_accumulator: String,
    scale: String,
}

impl StoreSource {
    pub fn new(path: impl AsRef<Path>, window_start: u64, window_end: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            window_start,
            window_end,
        }
    }

    fn read_rows(&self) -> Result<Vec<StoreRow>> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| PipelineError::SourceUnavailable(format!("store open failed: {e}")))?;
        // Everything below borrows `conn`; it is dropped (and the handle
        // closed) on every exit path of this function.
        let mut stmt = conn
            .prepare(STORE_QUERY)
            .map_err(|e| PipelineError::SourceUnavailable(format!("store query failed: {e}")))?;
        let rows = stmt
            .query_map(
                params![self.window_start as i64, self.window_end as i64],
                |row| {
                    Ok(StoreRow {
                        timestamp: row.get(0)?,
                        collateral_asset: row.get(1)?,
                        collateral_asset_price: row.get(2)?,
                        reserve: row.get(3)?,
                        total_nominal_debt: row.get(4)?,
                        last_rate_accumulator: row.get(5)?,
                        scale: row.get(6)?,
                    })
                },
            )
            .map_err(|e| PipelineError::SourceUnavailable(format!("store query failed: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::SourceUnavailable(format!("store read failed: {e}")))
    }
}

/// Re-shape a store row into the positional form the decoder expects under the
/// current layout. Columns the store does not keep are padded with `0x0`.
fn to_raw_event(row: StoreRow) -> RawEvent {
    let map = Layout::Current.field_map();
    let mut fields = vec!["0x0".to_string(); Layout::Current.min_fields()];
    fields[map.collateral_asset] = row.collateral_asset;
    fields[map.total_nominal_debt] = row.total_nominal_debt;
    fields[map.reserve] = row.reserve;
    fields[map.scale] = row.scale;
    fields[map.last_updated] = format!("{:#x}", row.timestamp.max(0));
    fields[map.last_rate_accumulator] = row.last_rate_accumulator;
    if let Some(index) = map.collateral_asset_price {
        fields[index] = row.collateral_asset_price;
    }
    RawEvent { fields }
}

#[async_trait]
impl EventSource for StoreSource {
    async fn fetch_events(&self) -> Result<Vec<RawEvent>> {
        let rows = self.read_rows()?;
        info!("[StoreSource] fetched {} rows", rows.len());
        Ok(rows.into_iter().map(to_raw_event).collect())
    }
}

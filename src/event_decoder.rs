use log::{debug, warn};

use crate::types::{AssetConfig, MarketCatalog, PipelineError, RawEvent, Result};
use crate::utils::decode_hex;

/// Wire layout of an `UpdateContext` event. The two known layouts differ by
/// the `is_legacy` flag at index 16 (which shifts `last_updated` to 17) and
/// the presence of the collateral price field at index 44.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Legacy,
    Current,
}

pub(crate) struct FieldMap {
    pub(crate) collateral_asset: usize,
    pub(crate) total_collateral_shares: usize,
    pub(crate) total_nominal_debt: usize,
    pub(crate) reserve: usize,
    pub(crate) max_utilization: usize,
    pub(crate) floor: usize,
    pub(crate) scale: usize,
    pub(crate) is_legacy: Option<usize>,
    pub(crate) last_updated: usize,
    pub(crate) last_rate_accumulator: usize,
    pub(crate) last_full_utilization_rate: usize,
    pub(crate) fee_rate: usize,
    pub(crate) collateral_asset_price: Option<usize>,
}

impl Layout {
    pub(crate) fn field_map(self) -> FieldMap {
        match self {
            Layout::Current => FieldMap {
                collateral_asset: 2,
                total_collateral_shares: 4,
                total_nominal_debt: 6,
                reserve: 8,
                max_utilization: 10,
                floor: 12,
                scale: 14,
                is_legacy: Some(16),
                last_updated: 17,
                last_rate_accumulator: 18,
                last_full_utilization_rate: 20,
                fee_rate: 22,
                collateral_asset_price: Some(44),
            },
            Layout::Legacy => FieldMap {
                collateral_asset: 2,
                total_collateral_shares: 4,
                total_nominal_debt: 6,
                reserve: 8,
                max_utilization: 10,
                floor: 12,
                scale: 14,
                is_legacy: None,
                last_updated: 16,
                last_rate_accumulator: 18,
                last_full_utilization_rate: 20,
                fee_rate: 22,
                collateral_asset_price: None,
            },
        }
    }

    /// Number of fields an event must carry to decode under this layout.
    pub fn min_fields(self) -> usize {
        let map = self.field_map();
        let last = map
            .collateral_asset_price
            .unwrap_or(map.fee_rate)
            .max(map.fee_rate);
        last + 1
    }
}

/// Decode one raw event into a named, typed `AssetConfig`. A missing field,
/// non-hex payload, or zero `scale` rejects this record only.
pub fn decode_event(raw: &RawEvent, layout: Layout) -> Result<AssetConfig> {
    let map = layout.field_map();
    let field = |index: usize| -> Result<&str> {
        raw.fields
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::Decode(format!("missing field at index {index}")))
    };

    let scale = decode_hex(field(map.scale)?)?;
    if scale == 0 {
        return Err(PipelineError::Decode("scale must be positive".into()));
    }

    let is_legacy = match map.is_legacy {
        Some(index) => decode_hex(field(index)?)? != 0,
        None => true,
    };
    let collateral_asset_price = match map.collateral_asset_price {
        Some(index) => Some(decode_hex(field(index)?)?),
        None => None,
    };

    Ok(AssetConfig {
        collateral_asset: field(map.collateral_asset)?.to_string(),
        total_collateral_shares: decode_hex(field(map.total_collateral_shares)?)?,
        total_nominal_debt: decode_hex(field(map.total_nominal_debt)?)?,
        reserve: decode_hex(field(map.reserve)?)?,
        max_utilization: decode_hex(field(map.max_utilization)?)?,
        floor: decode_hex(field(map.floor)?)?,
        scale,
        is_legacy,
        last_updated: u64::try_from(decode_hex(field(map.last_updated)?)?)
            .map_err(|_| PipelineError::Decode("timestamp exceeds 64 bits".into()))?,
        last_rate_accumulator: decode_hex(field(map.last_rate_accumulator)?)?,
        last_full_utilization_rate: decode_hex(field(map.last_full_utilization_rate)?)?,
        fee_rate: decode_hex(field(map.fee_rate)?)?,
        collateral_asset_price,
    })
}

/// Decode a batch and inner-join it against the market catalog. Malformed
/// records are dropped with a warning; unknown assets are dropped silently
/// (irrelevant assets are expected in the log).
pub fn decode_batch(
    raws: &[RawEvent],
    layout: Layout,
    catalog: &MarketCatalog,
) -> Vec<(String, AssetConfig)> {
    let mut decoded = Vec::new();
    for raw in raws {
        let config = match decode_event(raw, layout) {
            Ok(config) => config,
            Err(e) => {
                warn!("[EventDecoder] dropping malformed event: {e}");
                continue;
            }
        };
        match catalog.market(&config.collateral_asset) {
            Some(market) => decoded.push((market.to_string(), config)),
            None => debug!(
                "[EventDecoder] skipping unknown asset {}",
                config.collateral_asset
            ),
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC_ASSET: &str = "0x53c91253bc9682c04929ca02ed00b3e423f6710d2ee7e0d5ebb06f3ecf368a8";

    fn current_event(asset: &str) -> RawEvent {
        let mut fields = vec!["0x0".to_string(); 45];
        fields[2] = asset.to_string();
        fields[4] = "0xa".into(); // shares
        fields[6] = "0xde0b6b3a7640000".into(); // 1e18 nominal debt
        fields[8] = "0x3b9aca00".into(); // 1e9 reserve
        fields[14] = "0xf4240".into(); // scale 1e6
        fields[16] = "0x0".into(); // is_legacy
        fields[17] = "0x66b2a5c0".into(); // last_updated
        fields[18] = "0xde0b6b3a7640000".into(); // accumulator 1.0
        fields[20] = "0x5f5e100".into(); // full utilization rate
        fields[22] = "0x0".into(); // fee rate
        fields[44] = "0xde0b6b3a7640000".into(); // price 1.0
        RawEvent { fields }
    }

    #[test]
    fn decodes_current_layout() {
        let config = decode_event(&current_event(USDC_ASSET), Layout::Current).unwrap();
        assert_eq!(config.collateral_asset, USDC_ASSET);
        assert_eq!(config.total_nominal_debt, 1_000_000_000_000_000_000);
        assert_eq!(config.reserve, 1_000_000_000);
        assert_eq!(config.scale, 1_000_000);
        assert!(!config.is_legacy);
        assert_eq!(config.last_updated, 0x66b2a5c0);
        assert_eq!(
            config.collateral_asset_price,
            Some(1_000_000_000_000_000_000)
        );
    }

    #[test]
    fn decodes_legacy_layout_without_price() {
        let mut fields = vec!["0x0".to_string(); 23];
        fields[2] = USDC_ASSET.into();
        fields[6] = "0x64".into();
        fields[8] = "0xc8".into();
        fields[14] = "0x1".into();
        fields[16] = "0x66b2a5c0".into(); // last_updated moves to 16
        fields[18] = "0xde0b6b3a7640000".into();
        let config = decode_event(&RawEvent { fields }, Layout::Legacy).unwrap();
        assert!(config.is_legacy);
        assert_eq!(config.last_updated, 0x66b2a5c0);
        assert_eq!(config.collateral_asset_price, None);
    }

    #[test]
    fn one_bad_record_does_not_abort_the_batch() {
        let mut bad = current_event(USDC_ASSET);
        bad.fields[18] = "not-hex".into();
        let batch = vec![bad, current_event(USDC_ASSET)];
        let decoded = decode_batch(&batch, Layout::Current, &MarketCatalog::vesu_mainnet());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, "USDC");
    }

    #[test]
    fn short_event_is_rejected() {
        let raw = RawEvent {
            fields: vec!["0x1".into(); 10],
        };
        assert!(decode_event(&raw, Layout::Current).is_err());
    }

    #[test]
    fn oversized_timestamp_is_rejected() {
        let mut raw = current_event(USDC_ASSET);
        raw.fields[17] = "0xffffffffffffffffff".into(); // 72 bits
        assert!(matches!(
            decode_event(&raw, Layout::Current),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn zero_scale_is_rejected() {
        let mut raw = current_event(USDC_ASSET);
        raw.fields[14] = "0x0".into();
        assert!(matches!(
            decode_event(&raw, Layout::Current),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn unknown_assets_are_dropped_not_errors() {
        let batch = vec![current_event("0xdeadbeef")];
        let decoded = decode_batch(&batch, Layout::Current, &MarketCatalog::vesu_mainnet());
        assert!(decoded.is_empty());
    }

    #[test]
    fn catalog_lookup_is_case_exact() {
        let upper = USDC_ASSET.to_uppercase();
        let decoded = decode_batch(
            &[current_event(&upper)],
            Layout::Current,
            &MarketCatalog::vesu_mainnet(),
        );
        assert!(decoded.is_empty());
    }
}

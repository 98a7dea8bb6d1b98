//! Message Decoder
//!
//! Turns raw upstream frames into validated [`QuoteRecord`]s. Each feed type
//! has its own sub-decoder:
//!
//! - **Market data**: `MessagePack` binary frames ([`MarketDataDecoder`])
//! - **Portfolio**: JSON text frames ([`PortfolioDecoder`])
//!
//! A frame can carry several records (one per instrument) or none (control
//! and status frames). Any invalid field rejects the whole frame; callers
//! count the error and keep the session running.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::messages::{frame_type, FeedEntry, GreeksEntry, MarketDataFrame, PortfolioMessage};
use crate::domain::feed::{FeedType, Topic};
use crate::domain::quote::{
    DepthLevel, Greeks, MarketTick, PortfolioDelta, PortfolioUpdateKind, QuoteRecord,
};

// =============================================================================
// Error Type
// =============================================================================

/// Per-frame decode failure. Never fatal for the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Frame had no bytes.
    #[error("empty {0} frame")]
    Empty(FeedType),

    /// Frame could not be parsed (truncated, wrong encoding).
    #[error("malformed {feed} frame: {reason}")]
    Malformed {
        /// Feed the frame arrived on.
        feed: FeedType,
        /// Parser message.
        reason: String,
    },

    /// Frame type marker not recognised.
    #[error("unknown {feed} frame type: {frame_type}")]
    UnknownFrameType {
        /// Feed the frame arrived on.
        feed: FeedType,
        /// The marker received.
        frame_type: String,
    },

    /// A required field was absent.
    #[error("missing field {field} for {key}")]
    MissingField {
        /// Instrument key or entity the field belongs to.
        key: String,
        /// Field name.
        field: &'static str,
    },

    /// A numeric field was outside its valid range.
    #[error("field {field} out of range for {key}: {value}")]
    OutOfRange {
        /// Instrument key or entity the field belongs to.
        key: String,
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

impl DecodeError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Empty(_) => "empty",
            Self::Malformed { .. } => "malformed",
            Self::UnknownFrameType { .. } => "unknown_frame_type",
            Self::MissingField { .. } => "missing_field",
            Self::OutOfRange { .. } => "out_of_range",
        }
    }
}

// =============================================================================
// Entry Point
// =============================================================================

/// Single decode entry point dispatching on feed type.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageDecoder {
    market_data: MarketDataDecoder,
    portfolio: PortfolioDecoder,
}

impl MessageDecoder {
    /// Create a new decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            market_data: MarketDataDecoder,
            portfolio: PortfolioDecoder,
        }
    }

    /// Decode one raw frame, stamping records with `received_at`.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if the frame is empty, malformed or carries an
    /// out-of-range value.
    pub fn decode(
        &self,
        feed: FeedType,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<QuoteRecord>, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty(feed));
        }

        match feed {
            FeedType::MarketData => self.market_data.decode(raw, received_at),
            FeedType::Portfolio => self.portfolio.decode(raw, received_at),
        }
    }
}

// =============================================================================
// Market Data
// =============================================================================

/// Decoder for `MessagePack` market data frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketDataDecoder;

impl MarketDataDecoder {
    /// Decode a binary frame.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` for malformed frames or invalid ticks.
    pub fn decode(
        &self,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<QuoteRecord>, DecodeError> {
        let frame: MarketDataFrame =
            rmp_serde::from_slice(raw).map_err(|e| DecodeError::Malformed {
                feed: FeedType::MarketData,
                reason: e.to_string(),
            })?;

        match frame.frame_type.as_str() {
            frame_type::MARKET_INFO => return Ok(Vec::new()),
            frame_type::LIVE_FEED | frame_type::INITIAL_FEED => {}
            other => {
                return Err(DecodeError::UnknownFrameType {
                    feed: FeedType::MarketData,
                    frame_type: other.to_string(),
                });
            }
        }

        let frame_ts = frame.current_ts;
        frame
            .feeds
            .into_iter()
            .map(|(key, entry)| decode_tick(key, entry, frame_ts, received_at))
            .collect()
    }
}

fn decode_tick(
    key: String,
    entry: FeedEntry,
    frame_ts: Option<i64>,
    received_at: DateTime<Utc>,
) -> Result<QuoteRecord, DecodeError> {
    if key.is_empty() {
        return Err(DecodeError::MissingField {
            key,
            field: "instrument_key",
        });
    }

    let price = entry.ltp.ok_or_else(|| DecodeError::MissingField {
        key: key.clone(),
        field: "ltp",
    })?;
    non_negative(&key, "ltp", price)?;

    let size = to_quantity(&key, "ltq", entry.ltq.unwrap_or(0))?;

    if let Some(close) = entry.cp {
        non_negative(&key, "cp", close)?;
    }
    if let Some(oi) = entry.oi {
        non_negative(&key, "oi", oi)?;
    }

    let depth = entry
        .depth
        .into_iter()
        .map(|level| {
            non_negative(&key, "bp", level.bid_price)?;
            non_negative(&key, "ap", level.ask_price)?;
            Ok(DepthLevel {
                bid_price: level.bid_price,
                bid_quantity: to_quantity(&key, "bq", level.bid_quantity)?,
                ask_price: level.ask_price,
                ask_quantity: to_quantity(&key, "aq", level.ask_quantity)?,
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    if let Some(iv) = entry.iv {
        non_negative(&key, "iv", iv)?;
    }
    let greeks = entry.greeks.map(|g: GreeksEntry| Greeks {
        delta: g.delta,
        gamma: g.gamma,
        theta: g.theta,
        vega: g.vega,
        rho: g.rho,
        implied_volatility: entry.iv,
    });

    let source_timestamp = match entry.ltt.or(frame_ts) {
        Some(millis) => millis_to_datetime(&key, "ltt", millis)?,
        None => received_at,
    };

    Ok(QuoteRecord::tick(
        Topic::from(key),
        MarketTick {
            price,
            size,
            close_price: entry.cp,
            open_interest: entry.oi,
            depth,
            greeks,
        },
        source_timestamp,
        received_at,
    ))
}

// =============================================================================
// Portfolio
// =============================================================================

/// Decoder for JSON portfolio frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioDecoder;

impl PortfolioDecoder {
    /// Decode a text frame holding one update or an array of updates.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` for malformed JSON or invalid updates.
    pub fn decode(
        &self,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<QuoteRecord>, DecodeError> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| malformed(&e))?;

        let items = match value {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            other => {
                return Err(DecodeError::Malformed {
                    feed: FeedType::Portfolio,
                    reason: format!("expected object or array, got {other}"),
                });
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            if item.get("update_type").is_none() {
                if item.get("type").is_some() {
                    tracing::trace!(frame = %item, "Ignoring portfolio control frame");
                    continue;
                }
                return Err(DecodeError::MissingField {
                    key: "portfolio".to_string(),
                    field: "update_type",
                });
            }

            let message: PortfolioMessage =
                serde_json::from_value(item).map_err(|e| malformed(&e))?;
            records.push(decode_portfolio(message, received_at)?);
        }

        Ok(records)
    }
}

fn decode_portfolio(
    message: PortfolioMessage,
    received_at: DateTime<Utc>,
) -> Result<QuoteRecord, DecodeError> {
    let key = message
        .order_id
        .clone()
        .or_else(|| message.instrument_key.clone())
        .unwrap_or_else(|| message.update_type.clone());

    let kind = match message.update_type.as_str() {
        "order" => PortfolioUpdateKind::Order,
        "position" => PortfolioUpdateKind::Position,
        "holding" => PortfolioUpdateKind::Holding,
        other => {
            return Err(DecodeError::UnknownFrameType {
                feed: FeedType::Portfolio,
                frame_type: other.to_string(),
            });
        }
    };

    if kind == PortfolioUpdateKind::Order && message.order_id.is_none() {
        return Err(DecodeError::MissingField {
            key,
            field: "order_id",
        });
    }

    for (field, value) in [
        ("average_price", message.average_price),
        ("last_price", message.last_price),
    ] {
        if let Some(value) = value {
            non_negative(&key, field, value)?;
        }
    }
    let filled_quantity = to_quantity(&key, "filled_quantity", message.filled_quantity.unwrap_or(0))?;

    let source_timestamp = match message.timestamp {
        Some(millis) => millis_to_datetime(&key, "timestamp", millis)?,
        None => received_at,
    };

    Ok(QuoteRecord::portfolio(
        PortfolioDelta {
            kind,
            instrument_key: message.instrument_key,
            order_id: message.order_id,
            status: message.status,
            quantity: message.quantity,
            filled_quantity,
            average_price: message.average_price,
            last_price: message.last_price,
            pnl: message.pnl,
        },
        source_timestamp,
        received_at,
    ))
}

// =============================================================================
// Validation Helpers
// =============================================================================

fn malformed(error: &serde_json::Error) -> DecodeError {
    DecodeError::Malformed {
        feed: FeedType::Portfolio,
        reason: error.to_string(),
    }
}

fn non_negative(key: &str, field: &'static str, value: Decimal) -> Result<(), DecodeError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(DecodeError::OutOfRange {
            key: key.to_string(),
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn to_quantity(key: &str, field: &'static str, value: i64) -> Result<u64, DecodeError> {
    u64::try_from(value).map_err(|_| DecodeError::OutOfRange {
        key: key.to_string(),
        field,
        value: value.to_string(),
    })
}

fn millis_to_datetime(
    key: &str,
    field: &'static str,
    millis: i64,
) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DecodeError::OutOfRange {
            key: key.to_string(),
            field,
            value: millis.to_string(),
        })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::upstream::messages::DepthEntry;
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_718_000_001_000).unwrap()
    }

    fn entry(ltp: &str, ltq: i64) -> FeedEntry {
        FeedEntry {
            ltp: Some(ltp.parse().unwrap()),
            ltq: Some(ltq),
            ltt: Some(1_718_000_000_100),
            ..FeedEntry::default()
        }
    }

    fn frame(kind: &str, feeds: Vec<(&str, FeedEntry)>) -> Vec<u8> {
        MarketDataFrame {
            frame_type: kind.to_string(),
            current_ts: Some(1_718_000_000_123),
            feeds: feeds
                .into_iter()
                .map(|(k, e)| (k.to_string(), e))
                .collect::<BTreeMap<_, _>>(),
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn decodes_live_feed_ticks() {
        let decoder = MessageDecoder::new();
        let raw = frame(
            frame_type::LIVE_FEED,
            vec![("NSE_EQ|A", entry("100.5", 10)), ("NSE_EQ|B", entry("20", 0))],
        );

        let records = decoder.decode(FeedType::MarketData, &raw, now()).unwrap();

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.topic, Topic::from("NSE_EQ|A"));
        assert_eq!(first.feed, FeedType::MarketData);
        assert_eq!(first.received_at, now());
        assert!(!first.is_synthetic);
        assert_eq!(
            first.source_timestamp,
            Utc.timestamp_millis_opt(1_718_000_000_100).unwrap()
        );
        let tick = first.as_tick().unwrap();
        assert_eq!(tick.price, Decimal::new(1005, 1));
        assert_eq!(tick.size, 10);
    }

    #[test]
    fn decodes_depth_and_greeks() {
        let decoder = MessageDecoder::new();
        let mut option = entry("12.35", 50);
        option.oi = Some(Decimal::new(125_000, 0));
        option.iv = Some(Decimal::new(18, 2));
        option.depth = vec![DepthEntry {
            bid_price: Decimal::new(1230, 2),
            bid_quantity: 300,
            ask_price: Decimal::new(1240, 2),
            ask_quantity: 150,
        }];
        option.greeks = Some(GreeksEntry {
            delta: Decimal::new(-45, 2),
            ..GreeksEntry::default()
        });

        let raw = frame(frame_type::INITIAL_FEED, vec![("NSE_FO|OPT", option)]);
        let records = decoder.decode(FeedType::MarketData, &raw, now()).unwrap();
        let tick = records[0].as_tick().unwrap();

        assert_eq!(tick.depth[0].bid_quantity, 300);
        assert_eq!(tick.open_interest, Some(Decimal::new(125_000, 0)));
        let greeks = tick.greeks.unwrap();
        assert_eq!(greeks.delta, Decimal::new(-45, 2));
        assert_eq!(greeks.implied_volatility, Some(Decimal::new(18, 2)));
    }

    #[test]
    fn market_info_carries_no_records() {
        let decoder = MessageDecoder::new();
        let raw = frame(frame_type::MARKET_INFO, vec![]);
        assert!(decoder.decode(FeedType::MarketData, &raw, now()).unwrap().is_empty());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let decoder = MessageDecoder::new();
        let raw = frame("mystery", vec![]);
        assert!(matches!(
            decoder.decode(FeedType::MarketData, &raw, now()),
            Err(DecodeError::UnknownFrameType { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let decoder = MessageDecoder::new();
        let raw = frame(frame_type::LIVE_FEED, vec![("NSE_EQ|A", entry("1", 1))]);
        let truncated = &raw[..raw.len() / 2];
        let err = decoder
            .decode(FeedType::MarketData, truncated, now())
            .unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn empty_frame_is_rejected() {
        let decoder = MessageDecoder::new();
        assert_eq!(
            decoder.decode(FeedType::Portfolio, &[], now()),
            Err(DecodeError::Empty(FeedType::Portfolio))
        );
    }

    #[test]
    fn missing_price_is_rejected() {
        let decoder = MessageDecoder::new();
        let raw = frame(
            frame_type::LIVE_FEED,
            vec![("NSE_EQ|A", FeedEntry { ltq: Some(1), ..FeedEntry::default() })],
        );
        assert_eq!(
            decoder.decode(FeedType::MarketData, &raw, now()),
            Err(DecodeError::MissingField {
                key: "NSE_EQ|A".to_string(),
                field: "ltp",
            })
        );
    }

    #[test_case("-0.05", 1, "ltp" ; "negative price")]
    #[test_case("10", -1, "ltq" ; "negative size")]
    fn out_of_range_tick_rejects_frame(ltp: &str, ltq: i64, field: &str) {
        let decoder = MessageDecoder::new();
        let raw = frame(
            frame_type::LIVE_FEED,
            vec![("NSE_EQ|A", entry("1", 1)), ("NSE_EQ|B", entry(ltp, ltq))],
        );
        match decoder.decode(FeedType::MarketData, &raw, now()) {
            Err(DecodeError::OutOfRange { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn zero_price_is_accepted() {
        let decoder = MessageDecoder::new();
        let raw = frame(frame_type::LIVE_FEED, vec![("NSE_EQ|A", entry("0", 0))]);
        assert_eq!(decoder.decode(FeedType::MarketData, &raw, now()).unwrap().len(), 1);
    }

    #[test]
    fn decodes_portfolio_order_update() {
        let decoder = MessageDecoder::new();
        let raw = br#"{"update_type":"order","order_id":"240611000123","status":"complete",
            "instrument_key":"NSE_EQ|A","quantity":10,"filled_quantity":10,
            "average_price":"2890.55","timestamp":1718000000500}"#;

        let records = decoder.decode(FeedType::Portfolio, raw, now()).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.topic.is_portfolio());
        let delta = record.as_portfolio().unwrap();
        assert_eq!(delta.kind, PortfolioUpdateKind::Order);
        assert_eq!(delta.order_id.as_deref(), Some("240611000123"));
        assert_eq!(delta.filled_quantity, 10);
        assert_eq!(delta.average_price, Some(Decimal::new(289_055, 2)));
    }

    #[test]
    fn decodes_portfolio_batch_and_skips_control_frames() {
        let decoder = MessageDecoder::new();
        let raw = br#"[{"type":"heartbeat"},
            {"update_type":"position","instrument_key":"NSE_EQ|A","quantity":-5,"pnl":"-120.5"},
            {"update_type":"holding","instrument_key":"NSE_EQ|B","quantity":100}]"#;

        let records = decoder.decode(FeedType::Portfolio, raw, now()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_portfolio().unwrap().quantity, -5);
        assert_eq!(records[0].source_timestamp, now());
        assert_eq!(
            records[1].as_portfolio().unwrap().kind,
            PortfolioUpdateKind::Holding
        );
    }

    #[test_case(br#"{"update_type":"order","status":"open"}"# , "missing_field" ; "order without id")]
    #[test_case(br#"{"update_type":"dividend"}"# , "unknown_frame_type" ; "unknown update type")]
    #[test_case(br#"{"update_type":"position","last_price":"-1"}"# , "out_of_range" ; "negative price")]
    #[test_case(br#"{"update_type":"order","#, "malformed" ; "truncated json")]
    #[test_case(br#""hello""#, "malformed" ; "scalar frame")]
    #[test_case(br#"{"foo":1}"#, "missing_field" ; "no update type")]
    fn rejects_invalid_portfolio_frames(raw: &[u8], kind: &str) {
        let decoder = MessageDecoder::new();
        let err = decoder.decode(FeedType::Portfolio, raw, now()).unwrap_err();
        assert_eq!(err.kind(), kind);
    }
}

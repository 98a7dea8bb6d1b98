//! Quote Records
//!
//! Decoded, feed-agnostic records held in the last-value cache and handed
//! to consumers. The payload shape depends on the feed type:
//!
//! - **Market data**: [`MarketTick`] with price, size, depth, open interest, greeks
//! - **Portfolio**: [`PortfolioDelta`] describing an order, position or holding change

mod cache;

pub use cache::{QuoteCache, StaleDataError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::feed::{FeedType, Topic};

// =============================================================================
// Market Data Payload
// =============================================================================

/// One level of order book depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Best bid price at this level.
    pub bid_price: Decimal,
    /// Quantity bid at this level.
    pub bid_quantity: u64,
    /// Best ask price at this level.
    pub ask_price: Decimal,
    /// Quantity offered at this level.
    pub ask_quantity: u64,
}

/// Option sensitivities published with option ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Greeks {
    /// Delta - directional exposure.
    pub delta: Decimal,
    /// Gamma - rate of change of delta.
    pub gamma: Decimal,
    /// Theta - time decay per day.
    pub theta: Decimal,
    /// Vega - sensitivity to volatility.
    pub vega: Decimal,
    /// Rho - sensitivity to interest rates.
    pub rho: Decimal,
    /// Implied volatility, when provided.
    pub implied_volatility: Option<Decimal>,
}

/// A market data tick for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTick {
    /// Last traded price.
    pub price: Decimal,
    /// Last traded quantity.
    pub size: u64,
    /// Previous close, when provided.
    pub close_price: Option<Decimal>,
    /// Open interest for derivatives.
    pub open_interest: Option<Decimal>,
    /// Order book depth, best level first.
    pub depth: Vec<DepthLevel>,
    /// Option greeks for option instruments.
    pub greeks: Option<Greeks>,
}

impl MarketTick {
    /// Create a tick with only price and size.
    #[must_use]
    pub const fn new(price: Decimal, size: u64) -> Self {
        Self {
            price,
            size,
            close_price: None,
            open_interest: None,
            depth: Vec::new(),
            greeks: None,
        }
    }
}

// =============================================================================
// Portfolio Payload
// =============================================================================

/// What kind of portfolio entity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortfolioUpdateKind {
    /// Order status change (placed, filled, cancelled, rejected).
    Order,
    /// Intraday position change.
    Position,
    /// Delivery holding change.
    Holding,
}

/// A portfolio-wide update pushed by the portfolio feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioDelta {
    /// Entity that changed.
    pub kind: PortfolioUpdateKind,
    /// Instrument the update refers to.
    pub instrument_key: Option<String>,
    /// Broker order ID for order updates.
    pub order_id: Option<String>,
    /// Order status for order updates.
    pub status: Option<String>,
    /// Signed quantity (negative for short positions).
    pub quantity: i64,
    /// Filled quantity for order updates.
    pub filled_quantity: u64,
    /// Average fill or holding price.
    pub average_price: Option<Decimal>,
    /// Latest price of the instrument.
    pub last_price: Option<Decimal>,
    /// Profit and loss, when reported.
    pub pnl: Option<Decimal>,
}

// =============================================================================
// Quote Record
// =============================================================================

/// Typed payload of a [`QuoteRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuotePayload {
    /// Market data tick.
    Tick(MarketTick),
    /// Portfolio delta.
    Portfolio(PortfolioDelta),
}

/// The latest decoded value for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRecord {
    /// Feed the record belongs to.
    pub feed: FeedType,
    /// Subscription key.
    pub topic: Topic,
    /// Typed payload.
    pub payload: QuotePayload,
    /// Timestamp assigned by the provider.
    pub source_timestamp: DateTime<Utc>,
    /// Local time the frame was decoded.
    pub received_at: DateTime<Utc>,
    /// True when the value is a substitute served without a live session.
    pub is_synthetic: bool,
}

impl QuoteRecord {
    /// Create a live market data record.
    #[must_use]
    pub fn tick(
        topic: Topic,
        tick: MarketTick,
        source_timestamp: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            feed: FeedType::MarketData,
            topic,
            payload: QuotePayload::Tick(tick),
            source_timestamp,
            received_at,
            is_synthetic: false,
        }
    }

    /// Create a live portfolio record on the sentinel topic.
    #[must_use]
    pub fn portfolio(
        delta: PortfolioDelta,
        source_timestamp: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            feed: FeedType::Portfolio,
            topic: Topic::portfolio(),
            payload: QuotePayload::Portfolio(delta),
            source_timestamp,
            received_at,
            is_synthetic: false,
        }
    }

    /// Mark this record as synthetic.
    #[must_use]
    pub fn into_synthetic(mut self) -> Self {
        self.is_synthetic = true;
        self
    }

    /// Tick payload, if this is a market data record.
    #[must_use]
    pub const fn as_tick(&self) -> Option<&MarketTick> {
        match &self.payload {
            QuotePayload::Tick(tick) => Some(tick),
            QuotePayload::Portfolio(_) => None,
        }
    }

    /// Portfolio payload, if this is a portfolio record.
    #[must_use]
    pub const fn as_portfolio(&self) -> Option<&PortfolioDelta> {
        match &self.payload {
            QuotePayload::Portfolio(delta) => Some(delta),
            QuotePayload::Tick(_) => None,
        }
    }
}

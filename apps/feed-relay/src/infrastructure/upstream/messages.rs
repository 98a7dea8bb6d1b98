//! Upstream Wire Message Types
//!
//! Wire format types for the provider's authorization endpoint and the two
//! realtime streams. These map directly to the provider's schemas.
//!
//! # Market Data Stream (`MessagePack` binary frames)
//!
//! ```json
//! {
//!   "type": "live_feed",
//!   "currentTs": 1718000000123,
//!   "feeds": {
//!     "NSE_EQ|INE002A01018": {
//!       "ltp": "2890.55", "ltq": 25, "ltt": 1718000000100, "cp": "2871.10",
//!       "oi": null,
//!       "depth": [{"bp": "2890.50", "bq": 120, "ap": "2890.60", "aq": 80}],
//!       "greeks": null
//!     }
//!   }
//! }
//! ```
//!
//! Frame types: `initial_feed` (snapshot after subscribe), `live_feed`
//! (incremental), `market_info` (session status, carries no ticks).
//!
//! # Portfolio Stream (JSON text frames)
//!
//! ```json
//! {"update_type": "order", "order_id": "240611000123", "status": "complete",
//!  "instrument_key": "NSE_EQ|INE002A01018", "quantity": 10, "filled_quantity": 10,
//!  "average_price": "2890.55", "timestamp": 1718000000500}
//! ```
//!
//! Frames without `update_type` but with a `type` field are control frames.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Authorization
// =============================================================================

/// Response body of the feed authorization endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    /// `success` or `error`.
    pub status: String,
    /// Session data on success.
    #[serde(default)]
    pub data: Option<AuthorizeData>,
    /// Error entries on failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiErrorEntry>,
}

/// Session descriptor returned by a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeData {
    /// Socket URL to open.
    #[serde(rename = "socketEndpoint", alias = "authorized_redirect_uri")]
    pub socket_endpoint: String,
    /// Opaque session key presented on connect.
    #[serde(rename = "sessionKey", default)]
    pub session_key: Option<String>,
    /// Seconds until the session expires.
    #[serde(rename = "expiresIn", default)]
    pub expires_in: Option<i64>,
}

/// One error entry in a failed API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorEntry {
    /// Provider error code.
    #[serde(rename = "errorCode", default)]
    pub error_code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Market Data
// =============================================================================

/// Frame type marker for market data frames.
pub mod frame_type {
    /// Snapshot sent after a subscribe.
    pub const INITIAL_FEED: &str = "initial_feed";
    /// Incremental ticks.
    pub const LIVE_FEED: &str = "live_feed";
    /// Exchange session status; carries no ticks.
    pub const MARKET_INFO: &str = "market_info";
}

/// One binary market data frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataFrame {
    /// Frame type marker (see [`frame_type`]).
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Provider timestamp of the frame, millis since epoch.
    #[serde(rename = "currentTs", default)]
    pub current_ts: Option<i64>,
    /// Ticks keyed by instrument key.
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedEntry>,
}

impl MarketDataFrame {
    /// Encode as a `MessagePack` frame with named fields.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

/// Tick for one instrument inside a [`MarketDataFrame`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Last traded price.
    #[serde(default)]
    pub ltp: Option<Decimal>,
    /// Last traded quantity.
    #[serde(default)]
    pub ltq: Option<i64>,
    /// Last trade time, millis since epoch.
    #[serde(default)]
    pub ltt: Option<i64>,
    /// Previous close.
    #[serde(default)]
    pub cp: Option<Decimal>,
    /// Open interest.
    #[serde(default)]
    pub oi: Option<Decimal>,
    /// Order book depth, best level first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depth: Vec<DepthEntry>,
    /// Option greeks.
    #[serde(default)]
    pub greeks: Option<GreeksEntry>,
    /// Implied volatility.
    #[serde(default)]
    pub iv: Option<Decimal>,
}

/// One depth level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthEntry {
    /// Bid price.
    #[serde(rename = "bp")]
    pub bid_price: Decimal,
    /// Bid quantity.
    #[serde(rename = "bq")]
    pub bid_quantity: i64,
    /// Ask price.
    #[serde(rename = "ap")]
    pub ask_price: Decimal,
    /// Ask quantity.
    #[serde(rename = "aq")]
    pub ask_quantity: i64,
}

/// Option greeks on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreeksEntry {
    /// Delta.
    pub delta: Decimal,
    /// Gamma.
    pub gamma: Decimal,
    /// Theta.
    pub theta: Decimal,
    /// Vega.
    pub vega: Decimal,
    /// Rho.
    pub rho: Decimal,
}

// =============================================================================
// Portfolio
// =============================================================================

/// One portfolio update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioMessage {
    /// `order`, `position` or `holding`.
    pub update_type: String,
    /// Instrument the update refers to.
    #[serde(default)]
    pub instrument_key: Option<String>,
    /// Broker order ID.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Order status.
    #[serde(default)]
    pub status: Option<String>,
    /// Signed quantity.
    #[serde(default)]
    pub quantity: i64,
    /// Filled quantity for orders.
    #[serde(default)]
    pub filled_quantity: Option<i64>,
    /// Average price.
    #[serde(default)]
    pub average_price: Option<Decimal>,
    /// Last price.
    #[serde(default)]
    pub last_price: Option<Decimal>,
    /// Profit and loss.
    #[serde(default)]
    pub pnl: Option<Decimal>,
    /// Event time, millis since epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

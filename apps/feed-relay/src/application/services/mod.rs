//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `FeedRelay`: owns one supervisor per feed type and exposes subscribe,
//!   cache reads, health snapshots and alerts to the rest of the application

mod relay;

pub use relay::{FeedRelay, FeedRelayBuilder, RelayError};

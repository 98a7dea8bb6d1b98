//! Domain Layer - Core feed types and business logic.
//!
//! This layer contains the feed identifiers, decoded records, the
//! last-value cache and subscription bookkeeping. Nothing here performs
//! network I/O or spawns tasks.

/// Alert events raised by the streaming subsystem.
pub mod alert;

/// Wall-clock abstraction.
pub mod clock;

/// Feed types, topics, sessions and connection states.
pub mod feed;

/// Decoded quote records and the last-value cache.
pub mod quote;

/// Subscription tracking and management.
pub mod subscription;

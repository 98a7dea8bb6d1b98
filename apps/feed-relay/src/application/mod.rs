//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (authorization, sockets, alerts).
pub mod ports;

/// Application services exposing the downstream streaming API.
pub mod services;

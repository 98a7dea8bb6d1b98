//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Typed alert fan-out.
pub mod alerts;

/// Per-subscription delivery queues and workers.
pub mod broadcast;

/// Configuration from the environment.
pub mod config;

/// Health monitoring, auto-recovery and the HTTP health endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Brokerage feed authorization, sockets and decoding.
pub mod upstream;

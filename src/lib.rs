//! pingtrail - continuous ICMP latency monitoring.
//!
//! The [`engine::Engine`] owns the target registry, the probe scheduler, the
//! statistics aggregator, the daily JSON-lines log and the event publisher.
//! The [`web`] module exposes it over HTTP with a server-sent event stream.

pub mod config;
pub mod engine;
pub mod events;
pub mod log_writer;
pub mod models;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod web;

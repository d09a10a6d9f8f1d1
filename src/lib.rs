//! Edgegate - a self-hosted proxy data plane
//!
//! This library provides the pieces of a multi-listener edge proxy that:
//! - Forwards raw TCP and UDP streams to fixed backends
//! - Terminates HTTPS with per-hostname certificates, issued on demand
//! - Routes by Host header or SNI to virtual-host backends
//! - Redirects plain HTTP to HTTPS and answers ACME HTTP-01 challenges
//! - Tracks backend failures and short-circuits requests to down backends
//! - Buffers per-connection traffic samples and flushes them in batches
//! - Reconciles running listeners against a configuration store without restarts

pub mod acme;
pub mod admin;
pub mod alerting;
pub mod certs;
pub mod collab;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod proxy;
pub mod reconcile;
pub mod registry;
pub mod sni;
pub mod tls;

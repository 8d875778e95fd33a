//! Offline caching worker for the news dashboard.
//!
//! Every request the dashboard makes is classified by [`strategy`] and served
//! by the [`cache`] layer: static assets cache-first from the primary
//! generation, API calls and pages network-first with a runtime generation
//! and an offline document behind them. [`lifecycle`] pre-caches the essential
//! assets on install and evicts stale generations on activation, and [`sync`]
//! refreshes recent articles into the local [`db`] when connectivity returns.
//! [`worker::ServiceWorker`] ties these together behind one event dispatcher.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod strategy;
pub mod sync;
pub mod worker;

pub use error::{Result, WorkerError};
pub use worker::{EventOutcome, ServiceWorker, WorkerEvent, WorkerMessage};

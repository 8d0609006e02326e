//! minder-engine - Runtime layer for the entity ingestion and evaluation
//! pipeline.
//!
//! Where `minder-core` holds the pure domain types, this crate supplies the
//! moving parts that turn webhook-shaped bus messages into persisted,
//! evaluated entities:
//!
//! - [`store`]: the SQLite-backed entity and property store
//! - [`service`]: TTL-aware property retrieval layered over the store and a
//!   provider
//! - [`providers`]: the provider registry that instantiates and caches
//!   provider adapters per database record
//! - [`handlers`]: strategy-composed bus message handlers
//! - [`executor`]: the evaluation gate that serializes work per entity
//! - [`router`]: the in-process topic router the handlers and gate hang off
//! - [`metrics`]: Prometheus instrumentation for the above
//! - [`config`]: TOML engine configuration
//! - [`pipeline`]: wiring that assembles all of the above into a running
//!   pipeline
//!
//! # Runtime Requirements
//!
//! The router, handlers, and executor are tokio tasks; construct them inside
//! a tokio runtime. [`pipeline::Pipeline::start`] spawns one worker task per
//! subscribed topic.

pub mod config;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod router;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

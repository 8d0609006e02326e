//! minder-core - Domain layer for the entity ingestion and evaluation
//! pipeline.
//!
//! This crate holds the pure domain types the pipeline is built from:
//!
//! - [`entities`]: entity identity, the typed property bag, and its wire
//!   encoding
//! - [`proto`]: prost wire message bodies carried on the bus
//! - [`events`]: bus messages, topic names, and the entity envelope
//! - [`providers`]: the provider adapter trait the registry instantiates
//! - [`selectors`]: compilation and tri-state evaluation of profile
//!   selector expressions
//!
//! Everything that touches persistence, the message router, or a provider
//! registry lives in `minder-engine`.

pub mod entities;
pub mod events;
pub mod proto;
pub mod providers;
pub mod selectors;

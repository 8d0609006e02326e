//! Persistent catalog of entities and their cached properties.
//!
//! Backed by `SQLite` in WAL mode. Reads go through [`Database`] directly;
//! every mutation path takes a [`StoreTx`] so callers that cross multiple
//! mutations execute them in one atomic scope.

mod store;

pub use store::{
    Database, EntityFilter, ProjectFlags, PropertyRow, ProviderRecord, StoreError, StoreTx,
};

//! Provider instantiation and hint-based discovery.
//!
//! The registry maps stored provider configuration rows onto live
//! [`Provider`] instances. Builders are registered per provider class;
//! instantiated providers are cached so repeated lookups during a burst of
//! messages reuse one client.

pub(crate) mod registry;

pub use registry::{ProviderBuilder, ProviderManager, RegistryError};

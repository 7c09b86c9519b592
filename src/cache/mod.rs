//! Cached tree variants: one pre-built [`crate::tree::Tree`] per combination of tree name,
//! language, store and customer roles.

pub mod key;
pub mod store;

pub use key::{CacheVariantKey, DimPattern, DimToken, KeyPattern};
pub use store::{CacheBackend, CacheVariantStore, CachedTree, MemoryCacheBackend};

//! # arbor-core
//!
//! Hierarchical entity trees (category trees, navigation menus) kept consistent in storage
//! and served from many cached, pre-built variants.
//!
//! ## Overview
//!
//! Two problems sit at the center of this crate:
//!
//! - **Materialized paths.** Every row stores its ancestor chain as a path string (`"2/5/9"`),
//!   enabling prefix-based descendant queries. Moving a row rewrites its own path and every
//!   descendant's in one atomic unit, and a move that would place a row beneath itself is
//!   refused before anything is written.
//! - **Dimensioned cache invalidation.** Each logical tree is cached once per combination of
//!   language, store and customer roles. A mutation is classified into change reasons, and each
//!   reason picks the cheapest correct action: evict all variants, evict only store- or
//!   role-specific ones, patch nodes in place, or just notify.
//!
//! ## Architecture
//!
//! - **[`paths`]**: path codec, [`paths::CycleGuard`], [`paths::TreePathMaintainer`]
//! - **[`tree`]**: arena [`tree::Tree`], [`tree::TreeBuilder`] and node payloads
//! - **[`cache`]**: variant keys, the typed key pattern matcher, the cache backend contract
//! - **[`classify`]**, **[`invalidate`]**, **[`counts`]**: reasons, actions and lazy counts
//! - **[`event`]**, **[`hooks`]**: once-per-reason notification and the save-time pipeline
//! - **[`provider`]**: the read path, building variants on a miss
//! - **[`source`]**: the persistence contract, with an in-memory implementation
//! - **`db`** (feature `service`): SQLite persistence
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arbor_core::{
//!     cache::{CacheVariantKey, CacheVariantStore, MemoryCacheBackend},
//!     cancel::Cancel,
//!     config::ArborConfig,
//!     properties::HierarchicalEntity,
//!     provider::TreeProvider,
//!     source::{HierarchySource, MemorySource},
//!     tree::MenuItemInfo,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(MemorySource::new());
//!     let cancel = Cancel::never();
//!     let root = source
//!         .insert(HierarchicalEntity::draft("main", "Catalog"), &cancel)
//!         .await?;
//!     source
//!         .insert(HierarchicalEntity::draft("main", "Shoes").with_parent(root.id), &cancel)
//!         .await?;
//!
//!     let store = Arc::new(CacheVariantStore::<MenuItemInfo, _>::new(MemoryCacheBackend::new()));
//!     let provider = TreeProvider::new(source, store, ArborConfig::default());
//!     let tree = provider
//!         .get_tree(&CacheVariantKey::agnostic("main", 1), &cancel)
//!         .await?;
//!     print!("{}", tree.render(|item| item.name.clone()));
//!     Ok(())
//! }
//! ```
pub mod cache;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod counts;
#[cfg(feature = "service")]
pub mod db;
pub mod error;
pub mod event;
pub mod hooks;
pub mod invalidate;
pub mod paths;
pub mod properties;
pub mod provider;
pub mod source;
pub mod tree;

pub use error::*;

#[cfg(test)]
mod tests;

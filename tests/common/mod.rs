//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use arbor_core::properties::{EntityId, HierarchicalEntity};

pub const TREE: &str = "main";

/// Initialize tracing for tests, respecting RUST_LOG env var.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A published row of [`TREE`].
#[allow(dead_code)]
pub fn row(id: EntityId, parent: Option<EntityId>, path: &str, name: &str) -> HierarchicalEntity {
    let mut row = HierarchicalEntity::draft(TREE, name);
    row.id = id;
    row.parent_id = parent;
    row.tree_path = path.to_string();
    row.display_order = id as i32;
    row
}

/// Catalog rows: `2 > 5 > 9`, and `7` as a second root.
#[allow(dead_code)]
pub fn catalog() -> Vec<HierarchicalEntity> {
    vec![
        row(2, None, "2", "Apparel"),
        row(5, Some(2), "2/5", "Shoes"),
        row(9, Some(5), "2/5/9", "Boots"),
        row(7, None, "7", "Outlet"),
    ]
}

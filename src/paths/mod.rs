pub mod guard;
pub mod maintainer;
pub mod path;

pub use guard::{AncestorLookup, CycleGuard};
pub use maintainer::{ReconcileReport, TreePathMaintainer};
pub use path::{build, parse, SEPARATOR};

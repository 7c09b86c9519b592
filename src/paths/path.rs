//! Materialized ancestor paths.
//!
//! A path is the `/`-joined chain of ids from the root down to the node itself, e.g. `"3/5/9"`
//! for node 9 whose parent is 5 whose parent is the root 3. Ids are positive integers, so the
//! separator can never occur inside a segment and prefix matching on `path + "/"` selects
//! exactly the descendants of a node.

use crate::{error::ArborError, properties::EntityId};

pub const SEPARATOR: char = '/';

/// Append `id` to `parent_path`. An empty parent path builds a root path.
pub fn build(parent_path: &str, id: EntityId) -> Result<String, ArborError> {
    if id == 0 {
        return Err(ArborError::InvalidArgument(
            "path segments must be positive ids".to_string(),
        ));
    }
    let parent_path = parent_path.trim_end_matches(SEPARATOR);
    if parent_path.is_empty() {
        Ok(id.to_string())
    } else {
        Ok(format!("{parent_path}{SEPARATOR}{id}"))
    }
}

/// Ordered ids from the root down to (and including) the path's own node.
pub fn parse(path: &str) -> Result<Vec<EntityId>, ArborError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split(SEPARATOR)
        .map(|segment| match segment.parse::<EntityId>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(ArborError::InvalidArgument(format!(
                "invalid path segment '{segment}' in '{path}'"
            ))),
        })
        .collect()
}

/// The path of the parent node, or `""` for a root path.
pub fn parent_path(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// The prefix every strict descendant of `path` starts with.
pub fn descendant_prefix(path: &str) -> String {
    format!("{path}{SEPARATOR}")
}

/// True when `path` lies strictly beneath `ancestor`.
pub fn is_descendant_path(path: &str, ancestor: &str) -> bool {
    !ancestor.is_empty()
        && path.len() > ancestor.len() + 1
        && path.starts_with(ancestor)
        && path[ancestor.len()..].starts_with(SEPARATOR)
}

/// Replace the `old_prefix` of `path` with `new_prefix`, leaving the suffix intact. Returns
/// `None` when `path` is neither `old_prefix` itself nor beneath it.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        Some(new_prefix.to_string())
    } else if is_descendant_path(path, old_prefix) {
        Some(format!("{new_prefix}{}", &path[old_prefix.len()..]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_examples() {
        assert_eq!(build("", 5).unwrap(), "5");
        assert_eq!(build("3/5", 9).unwrap(), "3/5/9");
        assert!(matches!(build("3", 0), Err(ArborError::InvalidArgument(_))));
    }

    #[test]
    fn parse_examples() {
        assert_eq!(parse("3/5/9").unwrap(), vec![3, 5, 9]);
        assert_eq!(parse("").unwrap(), Vec::<EntityId>::new());
        assert!(parse("3//9").is_err());
        assert!(parse("3/x").is_err());
        assert!(parse("0/4").is_err());
    }

    #[test]
    fn parse_inverts_build() {
        let root = build("", 2).unwrap();
        let child = build(&root, 5).unwrap();
        let grandchild = build(&child, 9).unwrap();
        let ids = parse(&grandchild).unwrap();
        assert_eq!(ids.last(), Some(&9));
        assert_eq!(parent_path(&grandchild), child);
    }

    #[test]
    fn descendant_matching_is_segment_aligned() {
        assert!(is_descendant_path("2/5/9", "2/5"));
        assert!(!is_descendant_path("2/5", "2/5"));
        // 2/55 shares a textual prefix with 2/5 but is a sibling.
        assert!(!is_descendant_path("2/55", "2/5"));
        assert!(!is_descendant_path("2/5/9", ""));
    }

    #[test]
    fn rebase_replaces_prefix_only() {
        assert_eq!(rebase("2/5/9", "2/5", "7/5").as_deref(), Some("7/5/9"));
        assert_eq!(rebase("2/5", "2/5", "7/5").as_deref(), Some("7/5"));
        assert_eq!(rebase("2/55/9", "2/5", "7/5"), None);
    }
}

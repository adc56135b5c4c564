//! Slash-delimited path handling for the metadata tree.
//!
//! `"/"` and `""` both address the root; empty segments are dropped, so
//! `"//a///b/"` and `"/a/b"` name the same location.

/// Splits a path into its non-empty segments.
///
/// Idempotent with respect to re-joining: `split(&join(&split(p))) == split(p)`.
pub fn split(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Joins segments back into a canonical path with a leading slash.
pub fn join(segments: &[String]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// The dot-joined flat selector form of a path, for callers that index by a
/// single key instead of walking the tree.
pub fn selector(path: &str) -> String {
    split(path).join(".")
}

/// Well-known subtree holding the cluster membership roster.
pub const NODES_PREFIX: &str = "/cluster/nodes";

/// Path of the roster entry for `node_id`.
pub fn node_path(node_id: &str) -> String {
    format!("{}/{}", NODES_PREFIX, node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_empty_segments() {
        assert_eq!(split("/a/b/c/d"), vec!["a", "b", "c", "d"]);
        assert_eq!(split("a/b"), vec!["a", "b"]);
        assert_eq!(split("//a///b/"), vec!["a", "b"]);
    }

    #[test]
    fn root_paths_split_to_nothing() {
        assert!(split("/").is_empty());
        assert!(split("").is_empty());
    }

    #[test]
    fn split_join_is_idempotent() {
        for p in ["/a/b/c", "a/b/c/", "//x//y", "/", ""] {
            let once = split(p);
            assert_eq!(split(&join(&once)), once);
        }
    }

    #[test]
    fn selector_joins_with_dots() {
        assert_eq!(selector("/a/b/c/d"), "a.b.c.d");
        assert_eq!(selector("/"), "");
    }

    #[test]
    fn node_path_lands_under_roster() {
        assert_eq!(node_path("node1"), "/cluster/nodes/node1");
    }
}

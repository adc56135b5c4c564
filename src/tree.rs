//! In-memory hierarchical key/value tree addressed by slash-delimited paths.
//!
//! The root is always a mapping. `Set` replaces the subtree at a path while
//! preserving siblings; `Merge` only fills gaps, which is what lets several
//! nodes fan their bootstrap config into `/config/*` without clobbering the
//! values already agreed on.

use serde::{Deserialize, Serialize};

use crate::errors::CoordError;
use crate::pathutil;
use crate::value::{Fields, Value};

/// The hierarchical tree. Cheap to clone for snapshots: values are owned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tree {
    root: Fields,
}

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    /// Builds a tree from a normalized mapping value.
    pub fn from_value(value: Value) -> Result<Tree, CoordError> {
        match value {
            Value::Map(root) => Ok(Tree { root }),
            other => Err(CoordError::bad_encoding(format!(
                "tree root must be a mapping, got {:?}",
                other
            ))),
        }
    }

    pub fn from_json(src: &[u8]) -> Result<Tree, CoordError> {
        Tree::from_value(Value::parse_json(src)?)
    }

    pub fn from_yaml(src: &[u8]) -> Result<Tree, CoordError> {
        Tree::from_value(Value::parse_yaml(src)?)
    }

    /// Returns the value at `path`. The root path yields the whole tree as a
    /// mapping. Fails `NotFound` on a missing segment or when descending
    /// through a non-mapping.
    pub fn get(&self, path: &str) -> Result<Value, CoordError> {
        let segments = pathutil::split(path);
        if segments.is_empty() {
            return Ok(Value::Map(self.root.clone()));
        }

        let mut current = &self.root;
        let (last, intermediate) = segments.split_last().unwrap();
        for segment in intermediate {
            current = match current.get(segment) {
                Some(Value::Map(next)) => next,
                _ => return Err(CoordError::NotFound),
            };
        }
        current.get(last).cloned().ok_or(CoordError::NotFound)
    }

    /// `true` iff `get` succeeds with a non-null value. A missing path is not
    /// an error here.
    pub fn has(&self, path: &str) -> Result<bool, CoordError> {
        match self.get(path) {
            Ok(value) => Ok(!value.is_null()),
            Err(CoordError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replaces the subtree rooted at `path` with `value`, preserving
    /// siblings along the way. At the root path the whole tree is replaced
    /// and `value` must itself be a mapping.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), CoordError> {
        let segments = pathutil::split(path);
        if segments.is_empty() {
            self.root = match value {
                Value::Map(m) => m,
                other => {
                    return Err(CoordError::bad_encoding(format!(
                        "root value must be a mapping, got {:?}",
                        other
                    )))
                }
            };
            return Ok(());
        }

        if self.has(path)? {
            self.delete(path)?;
        }
        let chain = make_chain(&segments, value);
        merge_fields(&mut self.root, chain, true);
        Ok(())
    }

    /// Merges `value` at `path` without override: existing leaves win, only
    /// gaps are filled.
    pub fn merge(&mut self, path: &str, value: Value) -> Result<(), CoordError> {
        let segments = pathutil::split(path);
        if segments.is_empty() {
            match value {
                Value::Map(m) => {
                    merge_fields(&mut self.root, m, false);
                    Ok(())
                }
                other => Err(CoordError::bad_encoding(format!(
                    "root value must be a mapping, got {:?}",
                    other
                ))),
            }
        } else {
            let chain = make_chain(&segments, value);
            merge_fields(&mut self.root, chain, false);
            Ok(())
        }
    }

    /// Removes the entry at `path` from its parent mapping. Empty ancestor
    /// mappings are left in place. Fails `NotFound` on any missing segment,
    /// including the root path itself.
    pub fn delete(&mut self, path: &str) -> Result<(), CoordError> {
        let segments = pathutil::split(path);
        let (last, intermediate) = match segments.split_last() {
            Some(parts) => parts,
            None => return Err(CoordError::NotFound),
        };

        let mut current = &mut self.root;
        for segment in intermediate {
            current = match current.get_mut(segment) {
                Some(Value::Map(next)) => next,
                _ => return Err(CoordError::NotFound),
            };
        }
        current.remove(last).map(|_| ()).ok_or(CoordError::NotFound)
    }

    /// The tree as a plain mapping value.
    pub fn as_value(&self) -> Value {
        Value::Map(self.root.clone())
    }

    /// Deterministic JSON encoding of the whole tree (keys sorted).
    pub fn to_json_vec(&self) -> Result<Vec<u8>, CoordError> {
        serde_json::to_vec(&self.as_value().to_json()).map_err(CoordError::internal)
    }

    /// Deterministic YAML encoding of the whole tree (keys sorted).
    pub fn to_yaml_vec(&self) -> Result<Vec<u8>, CoordError> {
        serde_yaml::to_string(&self.as_value().to_yaml())
            .map(String::into_bytes)
            .map_err(CoordError::internal)
    }
}

/// Wraps `value` in nested single-key mappings, one level per segment.
fn make_chain(segments: &[String], value: Value) -> Fields {
    let (first, rest) = segments.split_first().expect("chain needs segments");
    let inner = if rest.is_empty() {
        value
    } else {
        Value::Map(make_chain(rest, value))
    };
    let mut fields = Fields::new();
    fields.insert(first.clone(), inner);
    fields
}

/// Recursive map merge. Two mappings merge key-by-key; for any other pair
/// the source wins only under override, except that a null destination is
/// treated as a gap and always filled.
fn merge_fields(dst: &mut Fields, src: Fields, override_existing: bool) {
    for (key, incoming) in src {
        match dst.get_mut(&key) {
            None => {
                dst.insert(key, incoming);
            }
            Some(existing) => match (existing, incoming) {
                (Value::Map(d), Value::Map(s)) => merge_fields(d, s, override_existing),
                (slot, incoming) => {
                    if override_existing || slot.is_null() {
                        *slot = incoming;
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn set_then_get_returns_value() {
        let mut tree = Tree::new();
        tree.set("/a/b/c", Value::Int(42)).unwrap();
        assert_eq!(tree.get("/a/b/c").unwrap(), Value::Int(42));
        assert_eq!(tree.get("/a/b").unwrap(), map(&[("c", Value::Int(42))]));
    }

    #[test]
    fn get_missing_segment_is_not_found() {
        let mut tree = Tree::new();
        tree.set("/a", Value::Int(1)).unwrap();
        assert_eq!(tree.get("/a/b").unwrap_err(), CoordError::NotFound);
        assert_eq!(tree.get("/x").unwrap_err(), CoordError::NotFound);
    }

    #[test]
    fn get_through_scalar_is_not_found() {
        let mut tree = Tree::new();
        tree.set("/a", Value::Str("leaf".into())).unwrap();
        assert_eq!(tree.get("/a/b/c").unwrap_err(), CoordError::NotFound);
    }

    #[test]
    fn root_get_returns_whole_tree() {
        let mut tree = Tree::new();
        tree.set("/", map(&[("a", Value::Int(1))])).unwrap();
        assert_eq!(tree.get("/").unwrap(), map(&[("a", Value::Int(1))]));
        assert_eq!(tree.get("").unwrap(), map(&[("a", Value::Int(1))]));
    }

    #[test]
    fn root_set_replaces_whole_tree() {
        let mut tree = Tree::new();
        tree.set("/", map(&[("a", Value::Int(1))])).unwrap();
        tree.set("/b/bb", map(&[("b", Value::Int(1))])).unwrap();

        tree.set("/", map(&[("a", Value::Int(1))])).unwrap();
        assert_eq!(tree.get("/").unwrap(), map(&[("a", Value::Int(1))]));
        assert_eq!(tree.get("/b").unwrap_err(), CoordError::NotFound);
    }

    #[test]
    fn root_set_rejects_scalar() {
        let mut tree = Tree::new();
        let err = tree.set("/", Value::Int(1)).unwrap_err();
        assert!(matches!(err, CoordError::BadEncoding(_)));
    }

    #[test]
    fn nested_set_preserves_siblings() {
        let mut tree = Tree::new();
        tree.set("/", map(&[("a", Value::Int(1))])).unwrap();
        tree.set("/b/bb", map(&[("b", Value::Int(1))])).unwrap();

        assert_eq!(
            tree.get("/b").unwrap(),
            map(&[("bb", map(&[("b", Value::Int(1))]))])
        );
        assert_eq!(tree.get("/a").unwrap(), Value::Int(1));
    }

    #[test]
    fn set_replaces_subtree_entirely() {
        let mut tree = Tree::new();
        tree.set("/a", map(&[("x", Value::Int(1)), ("y", Value::Int(2))]))
            .unwrap();
        tree.set("/a", map(&[("z", Value::Int(3))])).unwrap();
        assert_eq!(tree.get("/a").unwrap(), map(&[("z", Value::Int(3))]));
    }

    #[test]
    fn set_scalar_over_mapping_and_back() {
        let mut tree = Tree::new();
        tree.set("/a/b", Value::Int(1)).unwrap();
        tree.set("/a", Value::Str("flat".into())).unwrap();
        assert_eq!(tree.get("/a").unwrap(), Value::Str("flat".into()));

        tree.set("/a", map(&[("b", Value::Int(2))])).unwrap();
        assert_eq!(tree.get("/a/b").unwrap(), Value::Int(2));
    }

    #[test]
    fn merge_fills_gaps_but_keeps_existing() {
        let mut tree = Tree::new();
        tree.set("/", map(&[("a", Value::Int(1))])).unwrap();
        tree.merge("/", map(&[("a", Value::Int(9)), ("b", Value::Int(2))]))
            .unwrap();
        assert_eq!(
            tree.get("/").unwrap(),
            map(&[("a", Value::Int(1)), ("b", Value::Int(2))])
        );
    }

    #[test]
    fn merge_recurses_into_mappings() {
        let mut tree = Tree::new();
        tree.set("/cfg", map(&[("x", Value::Int(1))])).unwrap();
        tree.merge("/cfg", map(&[("x", Value::Int(5)), ("y", Value::Int(2))]))
            .unwrap();
        assert_eq!(
            tree.get("/cfg").unwrap(),
            map(&[("x", Value::Int(1)), ("y", Value::Int(2))])
        );
    }

    #[test]
    fn merge_fills_null_slots() {
        let mut tree = Tree::new();
        tree.set("/a", Value::Null).unwrap();
        tree.merge("/a", Value::Int(3)).unwrap();
        assert_eq!(tree.get("/a").unwrap(), Value::Int(3));
    }

    #[test]
    fn delete_removes_leaf_only() {
        let mut tree = Tree::new();
        tree.set("/a/b/c", Value::Int(1)).unwrap();
        tree.delete("/a/b/c").unwrap();

        assert_eq!(tree.get("/a/b/c").unwrap_err(), CoordError::NotFound);
        assert!(!tree.has("/a/b/c").unwrap());
        // Ancestors are not pruned.
        assert_eq!(tree.get("/a/b").unwrap(), Value::Map(Fields::new()));
    }

    #[test]
    fn delete_missing_path_is_not_found() {
        let mut tree = Tree::new();
        assert_eq!(tree.delete("/nope").unwrap_err(), CoordError::NotFound);
        assert_eq!(tree.delete("/").unwrap_err(), CoordError::NotFound);
    }

    #[test]
    fn has_treats_null_as_absent() {
        let mut tree = Tree::new();
        tree.set("/a", Value::Null).unwrap();
        assert!(!tree.has("/a").unwrap());
        tree.set("/a", Value::Int(0)).unwrap();
        assert!(tree.has("/a").unwrap());
    }

    #[test]
    fn json_roundtrip_equals_original() {
        let mut tree = Tree::new();
        tree.set("/a", Value::Int(1)).unwrap();
        tree.set("/b/c", map(&[("d", Value::List(vec![Value::Int(1), Value::Str("x".into())]))]))
            .unwrap();

        let encoded = tree.to_json_vec().unwrap();
        assert_eq!(Tree::from_json(&encoded).unwrap(), tree);
    }

    #[test]
    fn yaml_roundtrip_equals_original() {
        let mut tree = Tree::new();
        tree.set("/a", Value::Int(1)).unwrap();
        tree.set("/b", map(&[("flag", Value::Bool(true))])).unwrap();

        let encoded = tree.to_yaml_vec().unwrap();
        assert_eq!(Tree::from_yaml(&encoded).unwrap(), tree);
    }
}

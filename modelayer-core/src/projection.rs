//! Field projections and output trimming.
//!
//! A [`Projection`] is the wire shape of a sparse field request: an ordered map from
//! dot-separated path to an inclusion marker. Order is significant, it drives the order in
//! which the dependency resolver expands virtual fields.
//!
//! Two operations live here:
//!
//! - [`trim_to_requested`] cuts materialized documents back down to the shape the caller
//!   originally asked for, dropping anything that was only fetched or computed to satisfy a
//!   dependency.
//! - [`Projection::apply`] performs storage-side projection and is shared by backends that
//!   do not project natively.

use bson::{Bson, Document as BsonDocument};
use indexmap::{IndexMap, map::Entry};
use serde::{Deserialize, Serialize};

use crate::document::Document;

/// Separator between segments of a dot-path.
pub const PATH_SEPARATOR: char = '.';

/// An ordered mapping from dot-path to inclusion flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Projection(IndexMap<String, bool>);

impl Projection {
    /// Creates an empty projection, which selects everything.
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Adds an included path.
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.0.insert(path.into(), true);
        self
    }

    /// Adds an excluded path.
    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.0.insert(path.into(), false);
        self
    }

    /// Sets the flag for `path`, keeping its original position if it was already present.
    pub fn set(&mut self, path: impl Into<String>, include: bool) {
        self.0.insert(path.into(), include);
    }

    /// Inserts `path` only when it is not yet present. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, path: impl Into<String>, include: bool) -> bool {
        match self.0.entry(path.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(include);
                true
            }
        }
    }

    /// The flag for `path`, if the path is present.
    pub fn get(&self, path: &str) -> Option<bool> {
        self.0.get(path).copied()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of paths, inclusions and exclusions together.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Paths and their flags, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(path, include)| (path.as_str(), *include))
    }

    /// Included paths, in request order.
    pub fn included(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, include)| *include).map(|(path, _)| path)
    }

    /// Excluded paths, in request order.
    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, include)| !*include).map(|(path, _)| path)
    }

    /// Whether any path is included. A projection without inclusions is exclusion-only.
    pub fn has_inclusions(&self) -> bool {
        self.0.values().any(|include| *include)
    }

    /// Keeps only the paths for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, bool) -> bool) {
        self.0.retain(|path, include| keep(path, *include));
    }

    /// Reads a projection from its BSON wire form, e.g. `{ "title": 1, "author.name": true }`.
    ///
    /// Booleans and non-zero numbers are inclusion markers; `null`, `false` and zero exclude.
    pub fn from_document(document: &BsonDocument) -> Self {
        document
            .iter()
            .map(|(path, marker)| (path.clone(), is_truthy(marker)))
            .collect()
    }

    /// Renders the projection in its BSON wire form using `1`/`0` markers.
    pub fn to_document(&self) -> BsonDocument {
        self.iter()
            .map(|(path, include)| (path.to_string(), Bson::Int32(i32::from(include))))
            .collect()
    }

    /// Applies this projection to a stored document the way a document store would.
    ///
    /// With at least one inclusion only the included paths survive, plus `primary_key`
    /// unless it is explicitly excluded. Exclusions are removed afterwards. An empty
    /// projection returns the document unchanged.
    pub fn apply(&self, document: &BsonDocument, primary_key: &str) -> BsonDocument {
        let mut projected = if self.has_inclusions() {
            let mut tree = FieldTree::from_paths(self.included());

            if !self.contains(primary_key) {
                tree.insert(primary_key);
            }

            tree.trim(document)
        } else {
            document.clone()
        };

        for path in self.excluded() {
            remove_path(&mut projected, path);
        }

        projected
    }
}

impl<K: Into<String>> FromIterator<(K, bool)> for Projection {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(path, include)| (path.into(), include))
                .collect(),
        )
    }
}

fn is_truthy(marker: &Bson) -> bool {
    match marker {
        Bson::Boolean(value) => *value,
        Bson::Int32(value) => *value != 0,
        Bson::Int64(value) => *value != 0,
        Bson::Double(value) => *value != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

/// Splits a dot-path into its first segment and the remainder, if any.
pub fn split_root(path: &str) -> (&str, Option<&str>) {
    match path.split_once(PATH_SEPARATOR) {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    }
}

/// Nested view of a set of dot-paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FieldTree {
    nodes: IndexMap<String, FieldNode>,
}

#[derive(Debug, Clone, PartialEq)]
enum FieldNode {
    Leaf,
    Branch(FieldTree),
}

impl FieldTree {
    pub(crate) fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tree = FieldTree::default();

        for path in paths {
            tree.insert(path);
        }

        tree
    }

    /// Adds a path. A leaf always wins over a nested request for the same key.
    pub(crate) fn insert(&mut self, path: &str) {
        let (head, rest) = split_root(path);

        match (self.nodes.entry(head.to_string()), rest) {
            (Entry::Occupied(mut entry), None) => {
                entry.insert(FieldNode::Leaf);
            }
            (Entry::Occupied(mut entry), Some(rest)) => {
                if let FieldNode::Branch(subtree) = entry.get_mut() {
                    subtree.insert(rest);
                }
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(FieldNode::Leaf);
            }
            (Entry::Vacant(entry), Some(rest)) => {
                let mut subtree = FieldTree::default();
                subtree.insert(rest);
                entry.insert(FieldNode::Branch(subtree));
            }
        }
    }

    /// Copies the parts of `document` addressed by this tree, in tree order.
    pub(crate) fn trim(&self, document: &BsonDocument) -> BsonDocument {
        let mut trimmed = BsonDocument::new();

        for (key, node) in &self.nodes {
            let Some(value) = document.get(key) else {
                continue;
            };

            match node {
                FieldNode::Leaf => {
                    trimmed.insert(key.clone(), value.clone());
                }
                FieldNode::Branch(subtree) => {
                    if let Some(value) = subtree.trim_value(value) {
                        trimmed.insert(key.clone(), value);
                    }
                }
            }
        }

        trimmed
    }

    fn trim_value(&self, value: &Bson) -> Option<Bson> {
        match value {
            Bson::Document(document) => {
                let trimmed = self.trim(document);
                (!trimmed.is_empty()).then_some(Bson::Document(trimmed))
            }
            Bson::Array(items) => {
                let kept = items
                    .iter()
                    .filter_map(|item| match item {
                        Bson::Document(_) => self.trim_value(item),
                        _ => None,
                    })
                    .collect::<Vec<_>>();

                (!kept.is_empty()).then_some(Bson::Array(kept))
            }
            _ => None,
        }
    }
}

/// Trims a single BSON document to the included paths of `requested`.
pub fn trim_document(document: &BsonDocument, requested: &Projection) -> BsonDocument {
    FieldTree::from_paths(requested.included()).trim(document)
}

/// Trims materialized documents back down to exactly the originally requested fields.
///
/// Leaf keys are copied when present. Nested documents and arrays of documents are trimmed
/// recursively and dropped when nothing survives. Trimming twice with the same projection is
/// a no-op. A projection without inclusions leaves the documents untouched.
pub fn trim_to_requested(documents: &mut [Document], requested: &Projection) {
    if !requested.has_inclusions() {
        return;
    }

    let tree = FieldTree::from_paths(requested.included());

    for document in documents.iter_mut() {
        let trimmed = tree.trim(document.data());
        document.replace_data(trimmed);
    }
}

/// Removes a dot-path from a document, descending into arrays of documents.
pub(crate) fn remove_path(document: &mut BsonDocument, path: &str) {
    let (head, rest) = split_root(path);

    match rest {
        None => {
            document.remove(head);
        }
        Some(rest) => match document.get_mut(head) {
            Some(Bson::Document(nested)) => remove_path(nested, rest),
            Some(Bson::Array(items)) => {
                for item in items.iter_mut() {
                    if let Bson::Document(nested) = item {
                        remove_path(nested, rest);
                    }
                }
            }
            _ => {}
        },
    }
}

/// Reads a dot-path from a document, descending into nested documents.
pub fn get_path<'a>(document: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let (head, rest) = split_root(path);
    let value = document.get(head)?;

    match rest {
        None => Some(value),
        Some(rest) => match value {
            Bson::Document(nested) => get_path(nested, rest),
            _ => None,
        },
    }
}

//! Query expression evaluation for in-memory document filtering.

use std::{cmp::Ordering, collections::HashMap};
use bson::{Bson, Document as BsonDocument, datetime::DateTime};

use modelayer_core::{
    error::{ModelError, ModelResult},
    projection::get_path,
    query::{Expr, FieldOp, QueryVisitor},
};


/// Comparable view of a BSON value.
///
/// Numbers are normalized to `f64` so that `Int32(1)` equals `Double(1.0)`. Values with no
/// natural ordering (object ids, binaries, ...) compare by BSON equality only.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
    Raw(&'a Bson),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null | Bson::Undefined => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(f64::from(*value)),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(items) => Comparable::Array(items.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(key, value)| (key.as_str(), Comparable::from(value)))
                    .collect(),
            ),
            other => Comparable::Raw(other),
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            (Comparable::Raw(a), Comparable::Raw(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Whether the field value, or any of its elements when it is an array, appears in `candidates`.
fn intersects(field_value: &Comparable<'_>, candidates: &Comparable<'_>) -> bool {
    let candidates = match candidates {
        Comparable::Array(values) => values.iter().collect::<Vec<_>>(),
        single => vec![single],
    };

    match field_value {
        Comparable::Array(items) => items.iter().any(|item| candidates.contains(&item)),
        single => candidates.contains(&single),
    }
}


pub(crate) struct DocumentEvaluator<'a> {
    document: &'a BsonDocument,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a BsonDocument) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> ModelResult<bool> {
        self.visit_expr(expr)
    }

    pub fn filter_documents(
        documents: impl IntoIterator<Item = &'a BsonDocument>,
        expr: &Expr,
    ) -> ModelResult<Vec<&'a BsonDocument>> {
        let mut matched = Vec::new();

        for document in documents {
            if DocumentEvaluator::new(document).evaluate(expr)? {
                matched.push(document);
            }
        }

        Ok(matched)
    }
}

impl QueryVisitor for DocumentEvaluator<'_> {
    type Output = bool;
    type Error = ModelError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(get_path(self.document, field).is_some() == should_exist)
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let Some(field_value) = get_path(self.document, field) else {
            return Ok(matches!(op, FieldOp::Ne | FieldOp::NotContains | FieldOp::NoneOf));
        };

        let left = Comparable::from(field_value);
        let right = Comparable::from(value);

        let matched = match op {
            FieldOp::Eq => left == right,
            FieldOp::Ne => left != right,
            FieldOp::Gt => left.partial_cmp(&right) == Some(Ordering::Greater),
            FieldOp::Gte => matches!(left.partial_cmp(&right), Some(Ordering::Greater | Ordering::Equal)),
            FieldOp::Lt => left.partial_cmp(&right) == Some(Ordering::Less),
            FieldOp::Lte => matches!(left.partial_cmp(&right), Some(Ordering::Less | Ordering::Equal)),
            FieldOp::Contains | FieldOp::NotContains => {
                let contains = match (&left, &right) {
                    (Comparable::Array(items), needle) => items.iter().any(|item| item == needle),
                    (Comparable::String(haystack), Comparable::String(needle)) => haystack.contains(needle),
                    _ => false,
                };

                contains == matches!(op, FieldOp::Contains)
            }
            FieldOp::StartsWith => match (&left, &right) {
                (Comparable::String(text), Comparable::String(prefix)) => text.starts_with(prefix),
                _ => false,
            },
            FieldOp::EndsWith => match (&left, &right) {
                (Comparable::String(text), Comparable::String(suffix)) => text.ends_with(suffix),
                _ => false,
            },
            FieldOp::AnyOf => intersects(&left, &right),
            FieldOp::NoneOf => !intersects(&left, &right),
        };

        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use modelayer_core::query::Filter;

    fn matches(document: &BsonDocument, expr: Expr) -> bool {
        DocumentEvaluator::new(document).evaluate(&expr).unwrap()
    }

    #[test]
    fn compares_numbers_across_widths() {
        let document = doc! { "views": 10_i64 };

        assert!(matches(&document, Filter::eq("views", 10)));
        assert!(matches(&document, Filter::gte("views", 9.5)));
        assert!(!matches(&document, Filter::lt("views", 10)));
    }

    #[test]
    fn matches_object_ids_by_equality() {
        let id = ObjectId::new();
        let document = doc! { "_id": id };

        assert!(matches(&document, Filter::eq("_id", id)));
        assert!(matches(&document, Filter::one_of("_id", vec![Bson::ObjectId(ObjectId::new()), Bson::ObjectId(id)])));
        assert!(!matches(&document, Filter::eq("_id", ObjectId::new())));
    }

    #[test]
    fn any_of_and_none_of_handle_array_fields() {
        let document = doc! { "tags": ["rust", "db"] };

        assert!(matches(&document, Filter::any_of("tags", vec!["go", "db"])));
        assert!(matches(&document, Filter::none_of("tags", vec!["go"])));
        assert!(!matches(&document, Filter::none_of("tags", "rust")));
    }

    #[test]
    fn reads_nested_paths() {
        let document = doc! { "author": { "name": "ada" } };

        assert!(matches(&document, Filter::eq("author.name", "ada")));
        assert!(matches(&document, Filter::exists("author.name")));
        assert!(matches(&document, Filter::not_exists("author.email")));
    }

    #[test]
    fn missing_fields_only_satisfy_negative_operators() {
        let document = doc! {};

        assert!(!matches(&document, Filter::eq("a", 1)));
        assert!(matches(&document, Filter::ne("a", 1)));
        assert!(matches(&document, Filter::none_of("a", vec![1])));
    }
}

//! Document model and the query engine shared by storage adapters and the
//! client mirror.
//!
//! Documents are JSON objects. Filters, updates, and projections follow the
//! familiar document-store operator syntax (`{"age": {"$gt": 3}}`,
//! `{"$set": {"tag": "tr"}}`, `{"name": 1}`), restricted to the subset the
//! sync layer needs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Identity of a stored document.
pub type ItemId = String;

/// Field holding the document identity.
pub const ID_FIELD: &str = "_id";

/// Errors raised while evaluating filters, updates, or projections.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("the {ID_FIELD} field is immutable")]
    ImmutableId,
    #[error("invalid projection: {0}")]
    InvalidProjection(String),
    #[error("invalid find options: {0}")]
    InvalidOptions(String),
}

/// Returns the identity of a document, if it has one.
///
/// String ids are returned as-is; numeric ids are rendered in decimal.
pub fn item_id(doc: &Document) -> Option<ItemId> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds the filter selecting exactly one document by identity.
pub fn id_filter(id: &str) -> Value {
    let mut filter = Map::new();
    filter.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Value::Object(filter)
}

/// Builds the filter selecting every document whose identity is in `ids`.
pub fn ids_filter(ids: &[ItemId]) -> Value {
    let ids = ids.iter().cloned().map(Value::String).collect();
    let mut condition = Map::new();
    condition.insert("$in".to_string(), Value::Array(ids));
    let mut filter = Map::new();
    filter.insert(ID_FIELD.to_string(), Value::Object(condition));
    Value::Object(filter)
}

/// Options accepted by `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Sort specification: `{"field": 1 | -1, ...}`, applied in key order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    /// Number of matching documents to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Maximum number of documents to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Reads a possibly dotted path (`"a.b.c"`) from a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), QueryError> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    let mut target = doc;
    if let Some(parents) = parents {
        for segment in parents.split('.') {
            let entry = target
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            target = match entry {
                Value::Object(map) => map,
                _ => {
                    return Err(QueryError::InvalidUpdate(format!(
                        "cannot create field '{leaf}' inside non-object '{segment}'"
                    )))
                }
            };
        }
    }
    target.insert(leaf.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.rsplit_once('.') {
        None => {
            doc.shift_remove(path);
        }
        Some((parents, leaf)) => {
            let mut target = doc;
            for segment in parents.split('.') {
                target = match target.get_mut(segment) {
                    Some(Value::Object(map)) => map,
                    _ => return,
                };
            }
            target.shift_remove(leaf);
        }
    }
}

/// Structural equality that treats `1` and `1.0` as equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Orders two values of the same kind. Values of different kinds (or
/// objects/arrays) are not comparable and yield `None`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Returns true when `doc` satisfies `filter`.
///
/// A `null` filter matches every document.
pub fn matches(doc: &Document, filter: &Value) -> Result<bool, QueryError> {
    let filter = match filter {
        Value::Null => return Ok(true),
        Value::Object(map) => map,
        other => {
            return Err(QueryError::InvalidFilter(format!(
                "filter must be an object, got {other}"
            )))
        }
    };

    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(QueryError::UnsupportedOperator(op.to_string()))
            }
            path => matches_condition(get_path(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, condition: &'a Value) -> Result<&'a Vec<Value>, QueryError> {
    match condition {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(QueryError::InvalidFilter(format!(
            "{op} expects a non-empty array"
        ))),
    }
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn equals_or_contains(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(Value::Array(items)) if !target.is_array() => {
            items.iter().any(|item| values_equal(item, target))
        }
        Some(value) => values_equal(value, target),
    }
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> Result<bool, QueryError> {
    if !is_operator_object(condition) {
        return Ok(equals_or_contains(value, condition));
    }
    let Value::Object(ops) = condition else {
        return Ok(false);
    };
    for (op, arg) in ops {
        let matched = match op.as_str() {
            "$eq" => equals_or_contains(value, arg),
            "$ne" => !equals_or_contains(value, arg),
            "$gt" => compared(value, arg, |o| o == Ordering::Greater),
            "$gte" => compared(value, arg, |o| o != Ordering::Less),
            "$lt" => compared(value, arg, |o| o == Ordering::Less),
            "$lte" => compared(value, arg, |o| o != Ordering::Greater),
            "$in" => candidates(op, arg)?
                .iter()
                .any(|candidate| equals_or_contains(value, candidate)),
            "$nin" => !candidates(op, arg)?
                .iter()
                .any(|candidate| equals_or_contains(value, candidate)),
            "$exists" => match arg {
                Value::Bool(expected) => value.is_some() == *expected,
                _ => {
                    return Err(QueryError::InvalidFilter(
                        "$exists expects a boolean".to_string(),
                    ))
                }
            },
            "$not" => !matches_condition(value, arg)?,
            other => return Err(QueryError::UnsupportedOperator(other.to_string())),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compared(value: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, arg).is_some_and(&accept)),
        Some(value) => compare_values(value, arg).is_some_and(accept),
        None => false,
    }
}

fn candidates<'a>(op: &str, arg: &'a Value) -> Result<&'a Vec<Value>, QueryError> {
    match arg {
        Value::Array(items) => Ok(items),
        _ => Err(QueryError::InvalidFilter(format!("{op} expects an array"))),
    }
}

/// Applies an update specification to a document and returns the result.
///
/// The update is either an operator document (`$set`, `$unset`, `$inc`,
/// `$push`) or a replacement document. Replacements keep the original
/// identity; neither form may change it.
pub fn apply_update(doc: &Document, update: &Value) -> Result<Document, QueryError> {
    let Value::Object(spec) = update else {
        return Err(QueryError::InvalidUpdate(
            "update must be an object".to_string(),
        ));
    };

    let operators = spec.keys().filter(|k| k.starts_with('$')).count();
    if operators == 0 {
        return replace(doc, spec);
    }
    if operators != spec.len() {
        return Err(QueryError::InvalidUpdate(
            "cannot mix update operators and plain fields".to_string(),
        ));
    }

    let mut updated = doc.clone();
    for (op, fields) in spec {
        let Value::Object(fields) = fields else {
            return Err(QueryError::InvalidUpdate(format!("{op} expects an object")));
        };
        for (path, value) in fields {
            if path == ID_FIELD {
                match op.as_str() {
                    "$set" if doc.get(ID_FIELD).is_some_and(|id| values_equal(id, value)) => {
                        continue
                    }
                    _ => return Err(QueryError::ImmutableId),
                }
            }
            match op.as_str() {
                "$set" => set_path(&mut updated, path, value.clone())?,
                "$unset" => remove_path(&mut updated, path),
                "$inc" => {
                    let current = get_path(&updated, path).cloned();
                    let sum = add_numbers(current.as_ref(), value, path)?;
                    set_path(&mut updated, path, sum)?;
                }
                "$push" => {
                    let mut items = match get_path(&updated, path) {
                        None | Some(Value::Null) => Vec::new(),
                        Some(Value::Array(items)) => items.clone(),
                        Some(_) => {
                            return Err(QueryError::InvalidUpdate(format!(
                                "$push target '{path}' is not an array"
                            )))
                        }
                    };
                    items.push(value.clone());
                    set_path(&mut updated, path, Value::Array(items))?;
                }
                other => return Err(QueryError::UnsupportedOperator(other.to_string())),
            }
        }
    }
    Ok(updated)
}

fn replace(doc: &Document, replacement: &Document) -> Result<Document, QueryError> {
    let mut updated = Document::new();
    match (doc.get(ID_FIELD), replacement.get(ID_FIELD)) {
        (Some(old), Some(new)) if !values_equal(old, new) => return Err(QueryError::ImmutableId),
        (Some(old), _) => {
            updated.insert(ID_FIELD.to_string(), old.clone());
        }
        (None, Some(new)) => {
            updated.insert(ID_FIELD.to_string(), new.clone());
        }
        (None, None) => {}
    }
    for (key, value) in replacement {
        if key != ID_FIELD {
            updated.insert(key.clone(), value.clone());
        }
    }
    Ok(updated)
}

fn add_numbers(current: Option<&Value>, delta: &Value, path: &str) -> Result<Value, QueryError> {
    let Value::Number(delta) = delta else {
        return Err(QueryError::InvalidUpdate(format!(
            "$inc value for '{path}' must be a number"
        )));
    };
    let current = match current {
        None | Some(Value::Null) => return Ok(Value::Number(delta.clone())),
        Some(Value::Number(n)) => n,
        Some(_) => {
            return Err(QueryError::InvalidUpdate(format!(
                "$inc target '{path}' is not a number"
            )))
        }
    };
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::Number(sum.into()));
        }
    }
    let sum = current.as_f64().unwrap_or_default() + delta.as_f64().unwrap_or_default();
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| QueryError::InvalidUpdate(format!("$inc on '{path}' overflowed")))
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}

/// Applies a projection (`{"field": 1}` to include, `{"field": 0}` to
/// exclude). An empty or `null` projection returns the document unchanged.
pub fn project(doc: &Document, projection: &Value) -> Result<Document, QueryError> {
    let spec = match projection {
        Value::Null => return Ok(doc.clone()),
        Value::Object(spec) if spec.is_empty() => return Ok(doc.clone()),
        Value::Object(spec) => spec,
        _ => {
            return Err(QueryError::InvalidProjection(
                "projection must be an object".to_string(),
            ))
        }
    };

    let mut include_id = true;
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for (path, flag) in spec {
        let flag = truthy(flag).ok_or_else(|| {
            QueryError::InvalidProjection(format!("'{path}' must be 0, 1, true or false"))
        })?;
        if path == ID_FIELD {
            include_id = flag;
        } else if flag {
            includes.push(path.as_str());
        } else {
            excludes.push(path.as_str());
        }
    }
    if !includes.is_empty() && !excludes.is_empty() {
        return Err(QueryError::InvalidProjection(
            "cannot mix inclusion and exclusion".to_string(),
        ));
    }

    if includes.is_empty() {
        let mut projected = doc.clone();
        for path in excludes {
            remove_path(&mut projected, path);
        }
        if !include_id {
            projected.shift_remove(ID_FIELD);
        }
        return Ok(projected);
    }

    let mut projected = Document::new();
    if include_id {
        if let Some(id) = doc.get(ID_FIELD) {
            projected.insert(ID_FIELD.to_string(), id.clone());
        }
    }
    for path in includes {
        if let Some(value) = get_path(doc, path) {
            set_path(&mut projected, path, value.clone())?;
        }
    }
    Ok(projected)
}

/// Sorts, skips, and limits a result set.
pub fn apply_find_options(
    mut docs: Vec<Document>,
    options: &FindOptions,
) -> Result<Vec<Document>, QueryError> {
    if let Some(sort) = &options.sort {
        let keys = sort_keys(sort)?;
        docs.sort_by(|a, b| {
            for (path, descending) in &keys {
                let order = sort_order(get_path(a, path), get_path(b, path));
                let order = if *descending { order.reverse() } else { order };
                if order != Ordering::Equal {
                    return order;
                }
            }
            Ordering::Equal
        });
    }
    let skip = options.skip.unwrap_or(0);
    let docs = docs.into_iter().skip(skip);
    Ok(match options.limit {
        Some(limit) if limit > 0 => docs.take(limit).collect(),
        _ => docs.collect(),
    })
}

fn sort_keys(sort: &Value) -> Result<Vec<(String, bool)>, QueryError> {
    let Value::Object(spec) = sort else {
        return Err(QueryError::InvalidOptions(
            "sort must be an object".to_string(),
        ));
    };
    spec.iter()
        .map(|(path, direction)| match direction.as_i64() {
            Some(1) => Ok((path.clone(), false)),
            Some(-1) => Ok((path.clone(), true)),
            _ => Err(QueryError::InvalidOptions(format!(
                "sort direction for '{path}' must be 1 or -1"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[test]
    fn implicit_equality_and_dotted_paths() {
        let d = doc(json!({"_id": "a", "tag": "tr", "meta": {"depth": 2}}));
        assert!(matches(&d, &json!({"tag": "tr"})).unwrap());
        assert!(matches(&d, &json!({"meta.depth": 2.0})).unwrap());
        assert!(!matches(&d, &json!({"tag": "td"})).unwrap());
        assert!(matches(&d, &json!({})).unwrap());
        assert!(matches(&d, &Value::Null).unwrap());
    }

    #[test]
    fn missing_field_matches_null() {
        let d = doc(json!({"a": 1}));
        assert!(matches(&d, &json!({"b": null})).unwrap());
        assert!(!matches(&d, &json!({"b": {"$exists": true}})).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let d = doc(json!({"age": 30, "name": "kim"}));
        assert!(matches(&d, &json!({"age": {"$gt": 18, "$lte": 30}})).unwrap());
        assert!(!matches(&d, &json!({"age": {"$lt": 30}})).unwrap());
        assert!(matches(&d, &json!({"name": {"$in": ["lee", "kim"]}})).unwrap());
        assert!(matches(&d, &json!({"name": {"$nin": ["lee"]}})).unwrap());
        assert!(matches(&d, &json!({"name": {"$ne": "lee"}})).unwrap());
        // Mismatched kinds never compare.
        assert!(!matches(&d, &json!({"name": {"$gt": 3}})).unwrap());
    }

    #[test]
    fn array_fields_match_any_element() {
        let d = doc(json!({"tags": ["a", "b"]}));
        assert!(matches(&d, &json!({"tags": "b"})).unwrap());
        assert!(matches(&d, &json!({"tags": ["a", "b"]})).unwrap());
        assert!(!matches(&d, &json!({"tags": "c"})).unwrap());
    }

    #[test]
    fn logical_operators() {
        let d = doc(json!({"a": 1, "b": 2}));
        assert!(matches(&d, &json!({"$or": [{"a": 5}, {"b": 2}]})).unwrap());
        assert!(!matches(&d, &json!({"$and": [{"a": 1}, {"b": 3}]})).unwrap());
        assert!(matches(&d, &json!({"$nor": [{"a": 5}]})).unwrap());
        assert!(matches(&d, &json!({"a": {"$not": {"$gt": 4}}})).unwrap());
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let d = doc(json!({"a": 1}));
        assert_eq!(
            matches(&d, &json!({"a": {"$regex": "x"}})),
            Err(QueryError::UnsupportedOperator("$regex".to_string()))
        );
        assert!(matches(&d, &json!([1])).is_err());
    }

    #[test]
    fn operator_updates() {
        let d = doc(json!({"_id": "x", "n": 1, "gone": true}));
        let updated = apply_update(
            &d,
            &json!({"$set": {"tag": "tr", "nested.v": 2}, "$unset": {"gone": ""}, "$inc": {"n": 2, "m": 1}, "$push": {"log": "a"}}),
        )
        .unwrap();
        assert_eq!(
            Value::Object(updated),
            json!({"_id": "x", "n": 3, "tag": "tr", "nested": {"v": 2}, "m": 1, "log": ["a"]})
        );
    }

    #[test]
    fn replacement_keeps_identity() {
        let d = doc(json!({"_id": "x", "a": 1}));
        let updated = apply_update(&d, &json!({"b": 2})).unwrap();
        assert_eq!(Value::Object(updated), json!({"_id": "x", "b": 2}));
        assert_eq!(
            apply_update(&d, &json!({"_id": "y"})),
            Err(QueryError::ImmutableId)
        );
        assert_eq!(
            apply_update(&d, &json!({"$set": {"_id": "y"}})),
            Err(QueryError::ImmutableId)
        );
    }

    #[test]
    fn mixed_update_is_rejected() {
        let d = doc(json!({"a": 1}));
        assert!(matches!(
            apply_update(&d, &json!({"$set": {"a": 2}, "b": 1})),
            Err(QueryError::InvalidUpdate(_))
        ));
    }

    #[test]
    fn projections() {
        let d = doc(json!({"_id": "x", "a": 1, "b": {"c": 2, "d": 3}}));
        assert_eq!(
            Value::Object(project(&d, &json!({"b.c": 1})).unwrap()),
            json!({"_id": "x", "b": {"c": 2}})
        );
        assert_eq!(
            Value::Object(project(&d, &json!({"a": 0, "_id": 0})).unwrap()),
            json!({"b": {"c": 2, "d": 3}})
        );
        assert!(project(&d, &json!({"a": 1, "b": 0})).is_err());
    }

    #[test]
    fn find_options_sort_skip_limit() {
        let docs = vec![
            doc(json!({"n": 2, "k": "b"})),
            doc(json!({"n": 1, "k": "a"})),
            doc(json!({"n": 2, "k": "a"})),
            doc(json!({"k": "z"})),
        ];
        let options = FindOptions {
            sort: Some(json!({"n": -1, "k": 1})),
            skip: Some(1),
            limit: Some(2),
        };
        let sorted = apply_find_options(docs, &options).unwrap();
        let keys: Vec<_> = sorted.iter().map(|d| d["k"].clone()).collect();
        assert_eq!(keys, vec![json!("b"), json!("a")]);
    }

    #[test]
    fn id_helpers() {
        let d = doc(json!({"_id": 7}));
        assert_eq!(item_id(&d), Some("7".to_string()));
        assert_eq!(id_filter("a"), json!({"_id": "a"}));
        assert_eq!(
            ids_filter(&["a".to_string(), "b".to_string()]),
            json!({"_id": {"$in": ["a", "b"]}})
        );
    }
}

//! A small query DSL evaluator.
//!
//! Supports enough of the engine query language for tests: `match_all`,
//! `match`, `term`, `query_string` and `bool`. Anything else is rejected the
//! way the engine rejects an unknown query type.

use search_connector_repository::SearchError;
use serde_json::{Map, Value};

/// A compiled query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Matcher {
    All,
    /// Any analyzed token of `text` appears in `field`.
    Match { field: String, text: String },
    /// `field` equals `value` exactly.
    Term { field: String, value: Value },
    /// Any token of `text` appears in one of `fields` (all fields if empty).
    QueryString { fields: Vec<String>, text: String },
    Bool {
        must: Vec<Matcher>,
        should: Vec<Matcher>,
        must_not: Vec<Matcher>,
    },
}

/// Compile a serialized query expression.
pub(crate) fn compile(expression: &str) -> Result<Matcher, SearchError> {
    let value: Value = serde_json::from_str(expression)
        .map_err(|e| SearchError::query(format!("Failed to parse query: {}", e)))?;
    compile_value(&value)
}

fn compile_value(value: &Value) -> Result<Matcher, SearchError> {
    let (kind, body) = single_entry(value, "query")?;

    match kind.as_str() {
        "match_all" => Ok(Matcher::All),
        "match" => {
            let (field, options) = single_entry(body, "match")?;
            let text = match options {
                Value::Object(options) => options
                    .get("query")
                    .map(scalar_text)
                    .ok_or_else(|| SearchError::query("[match] requires a query"))?,
                other => scalar_text(other),
            };
            Ok(Matcher::Match { field, text })
        }
        "term" => {
            let (field, options) = single_entry(body, "term")?;
            let value = match options {
                Value::Object(options) => options
                    .get("value")
                    .cloned()
                    .ok_or_else(|| SearchError::query("[term] requires a value"))?,
                other => other.clone(),
            };
            Ok(Matcher::Term { field, value })
        }
        "query_string" => {
            let options = body
                .as_object()
                .ok_or_else(|| SearchError::query("[query_string] must be an object"))?;
            let text = options
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| SearchError::query("[query_string] requires a query"))?
                .to_string();
            let mut fields: Vec<String> = options
                .get("fields")
                .and_then(Value::as_array)
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if let Some(field) = options.get("default_field").and_then(Value::as_str) {
                fields.push(field.to_string());
            }
            Ok(Matcher::QueryString { fields, text })
        }
        "bool" => {
            let options = body
                .as_object()
                .ok_or_else(|| SearchError::query("[bool] must be an object"))?;
            let mut must = clauses(options, "must")?;
            must.extend(clauses(options, "filter")?);
            Ok(Matcher::Bool {
                must,
                should: clauses(options, "should")?,
                must_not: clauses(options, "must_not")?,
            })
        }
        other => Err(SearchError::query(format!("unknown query [{}]", other))),
    }
}

fn clauses(options: &Map<String, Value>, key: &str) -> Result<Vec<Matcher>, SearchError> {
    match options.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(compile_value).collect(),
        Some(single) => Ok(vec![compile_value(single)?]),
    }
}

fn single_entry<'a>(value: &'a Value, context: &str) -> Result<(String, &'a Value), SearchError> {
    let object = value
        .as_object()
        .ok_or_else(|| SearchError::query(format!("[{}] must be an object", context)))?;

    let mut entries = object.iter();
    match (entries.next(), entries.next()) {
        (Some((key, body)), None) => Ok((key.clone(), body)),
        _ => Err(SearchError::query(format!(
            "[{}] must have exactly one entry",
            context
        ))),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn field_contains_any(source: &Value, field: &str, text: &str) -> bool {
    let Some(value) = source.get(field) else {
        return false;
    };
    let haystack: Vec<String> = tokens(&scalar_text(value)).collect();
    tokens(text).any(|token| haystack.contains(&token))
}

impl Matcher {
    pub(crate) fn matches(&self, source: &Value) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Match { field, text } => field_contains_any(source, field, text),
            Matcher::Term { field, value } => source.get(field) == Some(value),
            Matcher::QueryString { fields, text } => {
                if fields.is_empty() {
                    source
                        .as_object()
                        .map(|object| {
                            object
                                .keys()
                                .any(|field| field_contains_any(source, field, text))
                        })
                        .unwrap_or(false)
                } else {
                    fields
                        .iter()
                        .any(|field| field_contains_any(source, field, text))
                }
            }
            Matcher::Bool {
                must,
                should,
                must_not,
            } => {
                must.iter().all(|m| m.matches(source))
                    && must_not.iter().all(|m| !m.matches(source))
                    && (should.is_empty()
                        || !must.is_empty()
                        || should.iter().any(|m| m.matches(source)))
            }
        }
    }
}

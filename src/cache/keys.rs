//! Cache key definitions.
//!
//! A [`CacheKey`] is the canonical identity of an `(endpoint, args)` pair.
//! Object keys are sorted before serialization so that argument shape never
//! affects identity.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::QueryError;

/// Canonical string identity for an endpoint + arguments pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-canonical key (used by custom serializers).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Custom `(endpoint, args) -> key` function installed per endpoint.
pub type KeySerializer = Arc<dyn Fn(&str, &Value) -> Result<CacheKey, QueryError> + Send + Sync>;

/// Convert caller arguments into the engine's plain-record form.
///
/// Fails with [`QueryError::Serialization`] when the value has no JSON
/// representation (for example a map keyed by tuples).
pub fn to_query_args<A>(args: &A) -> Result<Value, QueryError>
where
    A: Serialize + ?Sized,
{
    serde_json::to_value(args).map_err(|err| QueryError::serialization(err.to_string()))
}

/// Default key serializer: `endpoint(<canonical json>)`.
pub fn default_serialize_query_args(endpoint_name: &str, args: &Value) -> CacheKey {
    let mut out = String::with_capacity(endpoint_name.len() + 16);
    out.push_str(endpoint_name);
    out.push('(');
    write_canonical(args, &mut out);
    out.push(')');
    CacheKey(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(raw: &str, out: &mut String) {
    out.push_str(&Value::String(raw.to_owned()).to_string());
}

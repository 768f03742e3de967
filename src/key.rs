use crate::error::EncodingError;
use serde::Serialize;
use serde_json::Value;
use std::fmt::{self, Display};
use std::sync::Arc;

/// Canonical identifier of a logical data request, derived from query parameters.
///
/// Two structurally equal parameter sets produce the same key no matter in which order their fields were inserted.
/// Fields that serialize to `null` (i.e. `None`) are omitted, so `{a: 1, b: None}` and `{a: 1}` share a key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Arc<str>);

impl QueryKey {
    /// Derive the key from a parameter object. This is a pure function.
    pub fn from_params<P>(params: &P) -> Result<Self, EncodingError>
    where
        P: Serialize + ?Sized,
    {
        compute_key(params)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.0)
    }
}

impl AsRef<str> for QueryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Serialize `params` into its canonical key string.
///
/// Object members are written sorted by name at every nesting level and `null` members are dropped. Array element
/// order is significant and kept as is. Unit parameters are treated as an empty map.
pub fn compute_key<P>(params: &P) -> Result<QueryKey, EncodingError>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(params)?;
    let mut out = String::new();
    match &value {
        Value::Object(_) => write_canonical(&value, &mut out)?,
        Value::Null => out.push_str("{}"),
        other => return Err(EncodingError::NotAMap(value_kind(other))),
    }
    Ok(QueryKey(out.into()))
}

// serde_json's map ordering depends on the `preserve_order` feature which may get enabled by any other crate in the
// dependency graph. Hence ordering is enforced here explicitly.
fn write_canonical(value: &Value, out: &mut String) -> Result<(), EncodingError> {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> = map.iter().filter(|(_, v)| !v.is_null()).collect();
            members.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (name, member)) in members.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(name)?);
                out.push(':');
                write_canonical(member, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a map",
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute map carried by spans, events, metric points and log records.
///
/// Ordered so that equal attribute sets compare and serialize identically.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Attribute value types for record metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Short type name, used for exception attributes and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeValue {
    fn from(v: BTreeMap<String, AttributeValue>) -> Self {
        Self::Map(v)
    }
}

/// Builds an [`Attributes`] map from `key => value` pairs.
///
/// ```
/// use telemetry_pipeline::attrs;
/// let a = attrs! { "http.method" => "GET", "http.status_code" => 200 };
/// assert_eq!(a.len(), 2);
/// ```
#[macro_export]
macro_rules! attrs {
    () => { $crate::Attributes::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Attributes::new();
        $( map.insert(($key).to_string(), $crate::AttributeValue::from($value)); )+
        map
    }};
}

/// Canonical key for an attribute set, used to group metric observations.
pub(crate) fn attribute_set_key(attributes: &Attributes) -> String {
    // BTreeMap ordering makes the serialized form canonical.
    serde_json::to_string(attributes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_macro_and_conversions() {
        let a = attrs! { "s" => "x", "i" => 3, "f" => 1.5, "b" => true, "v" => vec!["a", "b"] };
        assert_eq!(a["s"], AttributeValue::String("x".into()));
        assert_eq!(a["i"], AttributeValue::Int(3));
        assert_eq!(a["f"].kind(), "float");
        assert_eq!(a["b"], AttributeValue::Bool(true));
        assert_eq!(a["v"].kind(), "array");
    }

    #[test]
    fn test_attribute_set_key_is_order_independent() {
        let mut a = Attributes::new();
        a.insert("b".into(), 1.into());
        a.insert("a".into(), 2.into());
        let mut b = Attributes::new();
        b.insert("a".into(), 2.into());
        b.insert("b".into(), 1.into());
        assert_eq!(attribute_set_key(&a), attribute_set_key(&b));
        assert_ne!(attribute_set_key(&a), attribute_set_key(&Attributes::new()));
    }
}

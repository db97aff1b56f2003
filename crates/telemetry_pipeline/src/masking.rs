//! Masking Stage
//!
//! Pure transform over attribute maps. Values whose key matches one of the
//! configured patterns are replaced, wholesale, by [`REDACTED`]. Maps and
//! arrays under non-matching keys are walked recursively so that nested
//! sensitive keys are caught too.
//!
//! Rules are written as strings:
//!
//! | Rule          | Matches keys…                          |
//! |---------------|----------------------------------------|
//! | `password`    | containing `password`                  |
//! | `=session`    | exactly `session`                      |
//! | `x-*-key`     | matching the glob                      |
//!
//! Matching is always case-insensitive.

use crate::attribute::{AttributeValue, Attributes};
use crate::error::ConfigurationError;
use crate::span::Span;
use glob::{MatchOptions, Pattern};

/// Fixed replacement for masked values.
pub const REDACTED: &str = "[REDACTED]";

/// Key fragments masked by default.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "authorization",
    "api_key",
    "apikey",
    "cookie",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A single key-matching rule.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPattern {
    /// Whole key equals the (lowercased) name
    Exact(String),
    /// Key contains the (lowercased) fragment
    Contains(String),
    /// Glob over the whole key
    Glob(Pattern),
}

impl KeyPattern {
    /// Parses the rule syntax described in the module docs.
    pub fn parse(rule: &str) -> Result<Self, ConfigurationError> {
        let rule = rule.trim();
        if rule.is_empty() || rule == "=" {
            return Err(ConfigurationError::InvalidPattern {
                pattern: rule.to_string(),
                reason: "empty rule".into(),
            });
        }
        if let Some(exact) = rule.strip_prefix('=') {
            return Ok(Self::Exact(exact.to_lowercase()));
        }
        if rule.contains(['*', '?', '[']) {
            return Pattern::new(rule)
                .map(Self::Glob)
                .map_err(|e| ConfigurationError::InvalidPattern {
                    pattern: rule.to_string(),
                    reason: e.to_string(),
                });
        }
        Ok(Self::Contains(rule.to_lowercase()))
    }

    fn matches(&self, lowered_key: &str) -> bool {
        match self {
            Self::Exact(name) => lowered_key == name,
            Self::Contains(fragment) => lowered_key.contains(fragment.as_str()),
            Self::Glob(pattern) => pattern.matches_with(lowered_key, MATCH_OPTIONS),
        }
    }
}

/// Compiled set of masking rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskingRules {
    patterns: Vec<KeyPattern>,
}

impl MaskingRules {
    /// No rules: masking is the identity.
    pub fn none() -> Self {
        Self::default()
    }

    /// Compiles rule strings, failing on the first invalid one.
    pub fn from_rules<I, S>(rules: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = rules
            .into_iter()
            .map(|r| KeyPattern::parse(r.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Rules built from [`DEFAULT_SENSITIVE_KEYS`].
    pub fn sensitive_defaults() -> Self {
        Self {
            patterns: DEFAULT_SENSITIVE_KEYS
                .iter()
                .map(|k| KeyPattern::Contains((*k).to_string()))
                .collect(),
        }
    }

    pub fn push(&mut self, pattern: KeyPattern) {
        self.patterns.push(pattern);
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if `key` is sensitive under these rules.
    pub fn is_sensitive(&self, key: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let lowered = key.to_lowercase();
        self.patterns.iter().any(|p| p.matches(&lowered))
    }
}

/// Returns a masked copy of `attributes`. Never fails.
pub fn mask(attributes: &Attributes, rules: &MaskingRules) -> Attributes {
    attributes
        .iter()
        .map(|(key, value)| (key.clone(), mask_entry(key, value, rules)))
        .collect()
}

fn mask_entry(key: &str, value: &AttributeValue, rules: &MaskingRules) -> AttributeValue {
    if rules.is_sensitive(key) {
        return AttributeValue::String(REDACTED.to_string());
    }
    mask_value(value, rules)
}

fn mask_value(value: &AttributeValue, rules: &MaskingRules) -> AttributeValue {
    match value {
        AttributeValue::Map(map) => AttributeValue::Map(mask(map, rules)),
        AttributeValue::Array(items) => {
            AttributeValue::Array(items.iter().map(|v| mask_value(v, rules)).collect())
        }
        scalar => scalar.clone(),
    }
}

/// Masks every attribute map of a finished span, producing a new span.
pub(crate) fn mask_span(span: Span, rules: &MaskingRules) -> Span {
    if rules.is_empty() {
        return span;
    }
    let attributes = mask(&span.attributes, rules);
    let events = span
        .events
        .iter()
        .map(|e| crate::span::SpanEvent {
            time_unix_nano: e.time_unix_nano,
            name: e.name.clone(),
            attributes: mask(&e.attributes, rules),
        })
        .collect();
    Span {
        attributes,
        events,
        ..span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn redacted() -> AttributeValue {
        AttributeValue::String(REDACTED.to_string())
    }

    #[test]
    fn test_masks_matching_keys_case_insensitively() {
        let rules = MaskingRules::sensitive_defaults();
        let masked = mask(
            &attrs! { "Password" => "x", "AUTHORIZATION" => "Bearer t", "user" => "bob" },
            &rules,
        );
        assert_eq!(masked["Password"], redacted());
        assert_eq!(masked["AUTHORIZATION"], redacted());
        assert_eq!(masked["user"], AttributeValue::from("bob"));
    }

    #[test]
    fn test_masks_non_string_values_wholesale() {
        let rules = MaskingRules::from_rules(["pin"]).unwrap();
        let masked = mask(&attrs! { "pin" => 1234, "pins_enabled" => true }, &rules);
        assert_eq!(masked["pin"], redacted());
        assert_eq!(masked["pins_enabled"], redacted());
    }

    #[test]
    fn test_masks_nested_maps_and_arrays() {
        let rules = MaskingRules::sensitive_defaults();
        let mut inner = BTreeMap::new();
        inner.insert("api_token".to_string(), AttributeValue::from("abc"));
        inner.insert("region".to_string(), AttributeValue::from("eu"));
        let mut attrs = Attributes::new();
        attrs.insert("request".into(), AttributeValue::Map(inner.clone()));
        attrs.insert(
            "history".into(),
            AttributeValue::Array(vec![AttributeValue::Map(inner)]),
        );

        let masked = mask(&attrs, &rules);
        let AttributeValue::Map(request) = &masked["request"] else {
            panic!("expected map");
        };
        assert_eq!(request["api_token"], redacted());
        assert_eq!(request["region"], AttributeValue::from("eu"));
        let AttributeValue::Array(history) = &masked["history"] else {
            panic!("expected array");
        };
        let AttributeValue::Map(first) = &history[0] else {
            panic!("expected map");
        };
        assert_eq!(first["api_token"], redacted());
    }

    #[test]
    fn test_exact_and_glob_rules() {
        let rules = MaskingRules::from_rules(["=session", "x-*-key"]).unwrap();
        assert!(rules.is_sensitive("SESSION"));
        assert!(!rules.is_sensitive("session_id"));
        assert!(rules.is_sensitive("X-Api-Key"));
        assert!(!rules.is_sensitive("x-api-id"));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(matches!(
            MaskingRules::from_rules([""]),
            Err(ConfigurationError::InvalidPattern { .. })
        ));
        assert!(matches!(
            MaskingRules::from_rules(["[unclosed"]),
            Err(ConfigurationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_empty_rules_are_identity() {
        let attrs = attrs! { "password" => "x" };
        assert_eq!(mask(&attrs, &MaskingRules::none()), attrs);
    }

    fn leaf() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            "[a-z]{0,6}".prop_map(AttributeValue::String),
            any::<i64>().prop_map(AttributeValue::Int),
            any::<bool>().prop_map(AttributeValue::Bool),
        ]
    }

    fn value() -> impl Strategy<Value = AttributeValue> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(AttributeValue::Array),
                prop::collection::btree_map("(token|name|Secret|id)[a-z]{0,2}", inner, 0..4)
                    .prop_map(AttributeValue::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_mask_is_idempotent(
            attrs in prop::collection::btree_map("(password|user|TOKEN|x)[a-z]{0,3}", value(), 0..6)
        ) {
            let rules = MaskingRules::sensitive_defaults();
            let once = mask(&attrs, &rules);
            let twice = mask(&once, &rules);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_mask_preserves_keys(
            attrs in prop::collection::btree_map("[a-zA-Z_]{1,10}", leaf(), 0..8)
        ) {
            let masked = mask(&attrs, &MaskingRules::sensitive_defaults());
            prop_assert_eq!(masked.keys().collect::<Vec<_>>(), attrs.keys().collect::<Vec<_>>());
        }
    }
}

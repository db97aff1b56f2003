//! Sampling strategies and call-site trace rules.

use crate::context::TraceContext;
use crate::error::ConfigurationError;
use glob::Pattern;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Debug;

/// Pluggable sampling strategy, consulted when a span starts.
pub trait Sampler: Send + Sync + Debug {
    /// Returns true if a span in `trace_id` should be recorded and exported.
    fn should_sample(&self, parent: Option<&TraceContext>, trace_id: u128, name: &str) -> bool;
}

/// Records every span.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOn;

impl Sampler for AlwaysOn {
    fn should_sample(&self, _parent: Option<&TraceContext>, _trace_id: u128, _name: &str) -> bool {
        true
    }
}

/// Records nothing; context still propagates.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOff;

impl Sampler for AlwaysOff {
    fn should_sample(&self, _parent: Option<&TraceContext>, _trace_id: u128, _name: &str) -> bool {
        false
    }
}

/// Samples a fixed fraction of traces, deterministically per trace id.
#[derive(Debug, Clone, Copy)]
pub struct TraceIdRatio {
    threshold: u64,
    ratio: f64,
}

impl TraceIdRatio {
    /// `ratio` is clamped to `[0, 1]`.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        let threshold = if ratio >= 1.0 {
            u64::MAX
        } else {
            (ratio * u64::MAX as f64) as u64
        };
        Self { threshold, ratio }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

impl Sampler for TraceIdRatio {
    fn should_sample(&self, _parent: Option<&TraceContext>, trace_id: u128, _name: &str) -> bool {
        if self.ratio <= 0.0 {
            return false;
        }
        // Low 64 bits are uniformly random for generated ids.
        (trace_id as u64) <= self.threshold
    }
}

/// Follows the parent's decision; roots are delegated to `root`.
#[derive(Debug, Clone)]
pub struct ParentBased<S> {
    root: S,
}

impl<S: Sampler> ParentBased<S> {
    pub fn new(root: S) -> Self {
        Self { root }
    }
}

impl<S: Sampler> Sampler for ParentBased<S> {
    fn should_sample(&self, parent: Option<&TraceContext>, trace_id: u128, name: &str) -> bool {
        match parent {
            Some(parent) => parent.sampled,
            None => self.root.should_sample(None, trace_id, name),
        }
    }
}

/// Include/exclude glob lists for one instrumentation layer, as written in config.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LayerRuleSpec {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Serialized form of [`TraceRules`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceRulesSpec {
    pub enabled: bool,
    pub layers: HashMap<String, LayerRuleSpec>,
}

impl Default for TraceRulesSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            layers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LayerRules {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

/// Per-layer call-site filter (e.g. `http` routes, `business` methods).
///
/// Decision for `(layer, target)`:
/// 1. tracing disabled → skip
/// 2. no rules for the layer → trace
/// 3. include list present and nothing matches → skip
/// 4. any exclude pattern matches → skip
/// 5. otherwise → trace
#[derive(Debug, Clone)]
pub struct TraceRules {
    enabled: bool,
    layers: HashMap<String, LayerRules>,
}

impl Default for TraceRules {
    fn default() -> Self {
        Self::allow_all()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, ConfigurationError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| ConfigurationError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl TraceRules {
    pub fn allow_all() -> Self {
        Self {
            enabled: true,
            layers: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            layers: HashMap::new(),
        }
    }

    pub fn from_spec(spec: &TraceRulesSpec) -> Result<Self, ConfigurationError> {
        let mut layers = HashMap::with_capacity(spec.layers.len());
        for (layer, rules) in &spec.layers {
            layers.insert(
                layer.clone(),
                LayerRules {
                    include: compile(&rules.include)?,
                    exclude: compile(&rules.exclude)?,
                },
            );
        }
        Ok(Self {
            enabled: spec.enabled,
            layers,
        })
    }

    pub fn should_trace(&self, layer: &str, target: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(rules) = self.layers.get(layer) else {
            return true;
        };
        if !rules.include.is_empty() && !rules.include.iter().any(|p| p.matches(target)) {
            return false;
        }
        !rules.exclude.iter().any(|p| p.matches(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> TraceRules {
        let mut layers = HashMap::new();
        layers.insert(
            "http".to_string(),
            LayerRuleSpec {
                include: vec!["/api/*".into()],
                exclude: vec!["/api/health*".into()],
            },
        );
        layers.insert(
            "business".to_string(),
            LayerRuleSpec {
                include: vec![],
                exclude: vec!["*.internal_*".into()],
            },
        );
        TraceRules::from_spec(&TraceRulesSpec {
            enabled: true,
            layers,
        })
        .unwrap()
    }

    #[test]
    fn test_trace_rules_decisions() {
        let rules = rules();
        assert!(rules.should_trace("http", "/api/deployments"));
        assert!(!rules.should_trace("http", "/api/healthz"));
        assert!(!rules.should_trace("http", "/static/app.js"));
        assert!(rules.should_trace("business", "Deployments.get_all"));
        assert!(!rules.should_trace("business", "Deployments.internal_sync"));
        assert!(rules.should_trace("db", "SELECT"));
    }

    #[test]
    fn test_disabled_rules_trace_nothing() {
        assert!(!TraceRules::disabled().should_trace("http", "/api"));
        assert!(TraceRules::allow_all().should_trace("http", "/api"));
    }

    #[test]
    fn test_ratio_extremes() {
        let never = TraceIdRatio::new(0.0);
        let always = TraceIdRatio::new(1.0);
        for id in [1u128, u64::MAX as u128, 42 << 64] {
            assert!(!never.should_sample(None, id, "op"));
            assert!(always.should_sample(None, id, "op"));
        }
    }

    #[test]
    fn test_ratio_is_deterministic_per_trace() {
        let sampler = TraceIdRatio::new(0.5);
        assert!(sampler.should_sample(None, 10, "a"));
        assert!(sampler.should_sample(None, 10, "b"));
        assert!(!sampler.should_sample(None, u64::MAX as u128, "a"));
    }

    #[test]
    fn test_parent_based_follows_parent() {
        let sampler = ParentBased::new(AlwaysOff);
        let mut parent = TraceContext::new_root(true);
        assert!(sampler.should_sample(Some(&parent), parent.trace_id, "child"));
        parent.sampled = false;
        assert!(!sampler.should_sample(Some(&parent), parent.trace_id, "child"));
        assert!(!sampler.should_sample(None, 7, "root"));
    }
}

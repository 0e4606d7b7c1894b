//! Policy model.
//!
//! A policy is a named configuration bundle consumed by the router, the
//! drivers, and the quota enforcer. The schema is closed: unknown keys are
//! rejected at parse time, and [`Policy::validate`] reports every remaining
//! problem with a path and a message. File parsing (YAML or otherwise) is a
//! caller concern; this module accepts already-parsed JSON values.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PilotError, PolicyIssue};

/// Default p95 sample window.
fn default_p95_window() -> usize {
    50
}

fn default_escalate_after() -> u32 {
    2
}

fn default_timezone() -> String {
    "UTC".to_string()
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Latency / cost / size targets for one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Objectives {
    /// Target p95 latency; exceeding it enables the pre-pick reorder.
    pub p95_latency_ms: u64,
    /// Informational cost ceiling, surfaced in reports only.
    pub max_cost_usd: f64,
    /// Token ceiling passed to the gateway.
    pub max_tokens: u32,
}

/// Model order and per-model parameter overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Routing {
    /// Ordered preferred models; must not be empty.
    pub primary: Vec<String>,
    #[serde(default)]
    pub backups: Vec<String>,
    #[serde(default = "default_p95_window")]
    pub p95_window_n: usize,
    /// Per-model generation overrides, applied on top of `gen`.
    #[serde(default)]
    pub params: BTreeMap<String, ModelParams>,
}

/// Failover behavior for the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    /// Stall cutoff: no first delta within this window fails the attempt.
    pub fallback_on_latency_ms: u64,
    /// Total attempts across the ladder, retries included.
    pub max_attempts: u32,
    /// Per-attempt sleeps; the last value repeats.
    pub backoff_ms: Vec<u64>,
    /// Buffer window before the first byte reaches the sink.
    #[serde(default)]
    pub first_chunk_gate_ms: u64,
    /// Fallback count at which an operator escalation is emitted.
    #[serde(default = "default_escalate_after")]
    pub escalate_after_fallbacks: u32,
}

/// Per-user limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tenancy {
    pub per_user_daily_tokens: u64,
    pub per_user_rpm: u32,
    /// IANA timezone name governing the daily reset.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Generation defaults applied before per-model overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_mode: Option<bool>,
}

/// Per-model override of the generation defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_mode: Option<bool>,
}

/// Validated configuration keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub objectives: Objectives,
    pub routing: Routing,
    pub strategy: Strategy,
    pub tenancy: Tenancy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen: Option<GenDefaults>,
}

// ---------------------------------------------------------------------------
// Parsing + validation
// ---------------------------------------------------------------------------

impl Policy {
    /// Parse a policy from an already-read JSON document and validate it.
    pub fn from_value(name: &str, value: serde_json::Value) -> Result<Self, PilotError> {
        let policy: Policy =
            serde_json::from_value(value).map_err(|e| PilotError::Policy {
                name: name.to_string(),
                issues: vec![PolicyIssue {
                    path: String::new(),
                    message: e.to_string(),
                }],
            })?;
        let issues = policy.validate();
        if issues.is_empty() {
            Ok(policy)
        } else {
            Err(PilotError::Policy {
                name: name.to_string(),
                issues,
            })
        }
    }

    /// Collect every schema-level problem, with its path.
    pub fn validate(&self) -> Vec<PolicyIssue> {
        let mut issues = Vec::new();
        let mut push = |path: &str, message: &str| {
            issues.push(PolicyIssue {
                path: path.to_string(),
                message: message.to_string(),
            });
        };

        if self.routing.primary.is_empty() {
            push("routing.primary", "must contain at least one model");
        }
        if self.routing.p95_window_n == 0 {
            push("routing.p95_window_n", "must be at least 1");
        }
        if self.strategy.max_attempts == 0 {
            push("strategy.max_attempts", "must be at least 1");
        }
        if self.strategy.backoff_ms.is_empty() {
            push("strategy.backoff_ms", "must contain at least one value");
        }
        if self.strategy.fallback_on_latency_ms == 0 {
            push("strategy.fallback_on_latency_ms", "must be positive");
        }
        if self.objectives.max_tokens == 0 {
            push("objectives.max_tokens", "must be positive");
        }
        if self.tenancy.per_user_rpm == 0 {
            push("tenancy.per_user_rpm", "must be at least 1");
        }
        if chrono_tz::Tz::from_str(&self.tenancy.timezone).is_err() {
            push("tenancy.timezone", "is not a known IANA timezone");
        }
        if let Some(ref gen) = self.gen {
            if let Some(t) = gen.temperature {
                if !(0.0..=2.0).contains(&t) {
                    push("gen.temperature", "must be within [0, 2]");
                }
            }
            if let Some(p) = gen.top_p {
                if !(0.0..=1.0).contains(&p) {
                    push("gen.top_p", "must be within [0, 1]");
                }
            }
        }

        issues
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    ///
    /// `params` is a BTreeMap so the canonical form is order-stable.
    pub fn canonical_hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Effective generation parameters for one model: `gen` defaults with the
    /// model's `routing.params` entry layered on top.
    pub fn merged_params(&self, model: &str) -> GenDefaults {
        let mut merged = self.gen.clone().unwrap_or_default();
        if let Some(overrides) = self.routing.params.get(model) {
            if overrides.temperature.is_some() {
                merged.temperature = overrides.temperature;
            }
            if overrides.top_p.is_some() {
                merged.top_p = overrides.top_p;
            }
            if overrides.stop.is_some() {
                merged.stop = overrides.stop.clone();
            }
            if overrides.json_mode.is_some() {
                merged.json_mode = overrides.json_mode;
            }
        }
        merged
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory set of named, validated policies.
///
/// Callers (the CLI, tests) populate it from whatever source they read.
#[derive(Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Policy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a policy under `name`, replacing any previous one.
    pub fn insert(&mut self, name: &str, policy: Policy) -> Result<(), PilotError> {
        let issues = policy.validate();
        if !issues.is_empty() {
            return Err(PilotError::Policy {
                name: name.to_string(),
                issues,
            });
        }
        self.policies.insert(name.to_string(), policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Policy, PilotError> {
        self.policies
            .get(name)
            .ok_or_else(|| PilotError::policy_missing(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_policy() -> serde_json::Value {
        json!({
            "objectives": { "p95_latency_ms": 1200, "max_cost_usd": 0.05, "max_tokens": 512 },
            "routing": {
                "primary": ["fast-model"],
                "backups": ["steady-model"],
                "p95_window_n": 50,
                "params": { "steady-model": { "temperature": 0.1 } }
            },
            "strategy": {
                "fallback_on_latency_ms": 1500,
                "max_attempts": 3,
                "backoff_ms": [100, 400],
                "first_chunk_gate_ms": 150,
                "escalate_after_fallbacks": 2
            },
            "tenancy": {
                "per_user_daily_tokens": 200_000,
                "per_user_rpm": 30,
                "timezone": "Europe/Berlin"
            },
            "gen": { "system": "Be brief.", "temperature": 0.7 }
        })
    }

    #[test]
    fn test_parse_valid_policy() {
        let policy = Policy::from_value("demo", sample_policy()).unwrap();
        assert_eq!(policy.routing.primary, vec!["fast-model"]);
        assert_eq!(policy.strategy.backoff_ms, vec![100, 400]);
        assert_eq!(policy.tenancy.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_defaults_fill_in() {
        let mut value = sample_policy();
        let routing = value["routing"].as_object_mut().unwrap();
        routing.remove("p95_window_n");
        routing.remove("params");
        value["strategy"].as_object_mut().unwrap().remove("first_chunk_gate_ms");
        value["tenancy"].as_object_mut().unwrap().remove("timezone");

        let policy = Policy::from_value("demo", value).unwrap();
        assert_eq!(policy.routing.p95_window_n, 50);
        assert_eq!(policy.strategy.first_chunk_gate_ms, 0);
        assert_eq!(policy.tenancy.timezone, "UTC");
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let policy = Policy::from_value("demo", sample_policy()).unwrap();
        let serialized = serde_json::to_value(&policy).unwrap();
        let reparsed = Policy::from_value("demo", serialized).unwrap();
        assert_eq!(policy, reparsed);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut value = sample_policy();
        value["routing"]["surprise"] = json!(true);
        let err = Policy::from_value("demo", value).unwrap_err();
        assert!(matches!(err, PilotError::Policy { .. }));
    }

    #[test]
    fn test_empty_primary_rejected_with_path() {
        let mut value = sample_policy();
        value["routing"]["primary"] = json!([]);
        let err = Policy::from_value("demo", value).unwrap_err();
        match err {
            PilotError::Policy { issues, .. } => {
                assert!(issues.iter().any(|i| i.path == "routing.primary"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let mut value = sample_policy();
        value["tenancy"]["timezone"] = json!("Mars/Olympus");
        let err = Policy::from_value("demo", value).unwrap_err();
        match err {
            PilotError::Policy { issues, .. } => {
                assert!(issues.iter().any(|i| i.path == "tenancy.timezone"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_canonical_hash_is_stable() {
        let a = Policy::from_value("demo", sample_policy()).unwrap();
        let b = Policy::from_value("demo", sample_policy()).unwrap();
        assert_eq!(a.canonical_hash(), b.canonical_hash());
        assert_eq!(a.canonical_hash().len(), 64);
    }

    #[test]
    fn test_canonical_hash_changes_with_content() {
        let a = Policy::from_value("demo", sample_policy()).unwrap();
        let mut value = sample_policy();
        value["objectives"]["max_tokens"] = json!(1024);
        let b = Policy::from_value("demo", value).unwrap();
        assert_ne!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn test_merged_params_layering() {
        let policy = Policy::from_value("demo", sample_policy()).unwrap();

        // fast-model has no overrides: gen defaults pass through.
        let fast = policy.merged_params("fast-model");
        assert_eq!(fast.temperature, Some(0.7));
        assert_eq!(fast.system.as_deref(), Some("Be brief."));

        // steady-model overrides temperature, keeps the system prompt.
        let steady = policy.merged_params("steady-model");
        assert_eq!(steady.temperature, Some(0.1));
        assert_eq!(steady.system.as_deref(), Some("Be brief."));
    }

    #[test]
    fn test_registry_roundtrip() {
        let mut registry = PolicyRegistry::new();
        let policy = Policy::from_value("demo", sample_policy()).unwrap();
        registry.insert("demo", policy.clone()).unwrap();
        assert_eq!(registry.get("demo").unwrap(), &policy);
        assert!(matches!(
            registry.get("absent"),
            Err(PilotError::Policy { .. })
        ));
    }
}

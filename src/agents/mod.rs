//! Typed sub-agents.
//!
//! An agent is a declarative definition: a name, the policy it runs under,
//! an optional system prompt, tool names, and permissive input/output
//! schemas. The controller resolves agents from the registry and enforces
//! the per-hop contract; chains compose hops.

pub mod chains;
pub mod controller;
pub mod http_fetch;

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PilotError;

/// System prompt used when an agent definition omits one.
pub const DEFAULT_SYSTEM: &str =
    "You are a precise sub-agent. Respond with a single strict JSON object and nothing else.";

// ---------------------------------------------------------------------------
// Schema subset
// ---------------------------------------------------------------------------

/// Property entry of the permissive schema subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Permissive schema subset: top-level `type`, per-property `type`, and
/// `required`. Anything else in the document is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl SchemaSpec {
    /// Structural check; returns one message per mismatch.
    pub fn check(&self, value: &Value) -> Vec<String> {
        let mut issues = Vec::new();

        if let Some(ref kind) = self.kind {
            if !type_matches(kind, value) {
                issues.push(format!("expected top-level type '{kind}'"));
            }
        }

        if let Value::Object(map) = value {
            for name in &self.required {
                if !map.contains_key(name) {
                    issues.push(format!("missing required property '{name}'"));
                }
            }
            for (name, prop) in &self.properties {
                let Some(ref kind) = prop.kind else { continue };
                if let Some(item) = map.get(name) {
                    if !type_matches(kind, item) {
                        issues.push(format!("property '{name}' is not of type '{kind}'"));
                    }
                }
            }
        } else if !self.required.is_empty() || !self.properties.is_empty() {
            issues.push("expected an object".into());
        }

        issues
    }
}

fn type_matches(kind: &str, value: &Value) -> bool {
    match kind {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Agent spec + registry
// ---------------------------------------------------------------------------

/// Declarative agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    /// Policy name the agent's calls run under.
    pub policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<SchemaSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<SchemaSpec>,
}

impl AgentSpec {
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t == name)
    }

    /// The effective system prompt (deterministic default when absent).
    pub fn system_prompt(&self) -> &str {
        self.system.as_deref().unwrap_or(DEFAULT_SYSTEM)
    }
}

/// Named agent definitions. Callers populate it from whatever source they
/// read (file parsing is a collaborator concern).
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: AgentSpec) {
        self.agents.insert(spec.name.clone(), spec);
    }

    /// Parse a spec from an already-read JSON document and register it.
    pub fn insert_value(&mut self, value: Value) -> Result<(), PilotError> {
        let spec: AgentSpec = serde_json::from_value(value).map_err(|e| PilotError::Agent {
            agent: "<unparsed>".into(),
            message: e.to_string(),
        })?;
        self.insert(spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&AgentSpec, PilotError> {
        self.agents.get(name).ok_or_else(|| PilotError::Agent {
            agent: name.to_string(),
            message: "agent not found".into(),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Task envelope
// ---------------------------------------------------------------------------

/// Per-hop budget ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HopBudget {
    pub tokens: u64,
    pub cost_usd: f64,
    pub time_ms: u64,
}

/// The typed call record passed into a sub-agent hop. Passed by value,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub envelope_version: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub agent: String,
    pub policy: String,
    pub budget: HopBudget,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

impl TaskEnvelope {
    pub fn new(task_id: &str, agent: &str, policy: &str, budget: HopBudget, input: Value) -> Self {
        Self {
            envelope_version: "1".into(),
            task_id: task_id.to_string(),
            parent_id: None,
            agent: agent.to_string(),
            policy: policy.to_string(),
            budget,
            input,
            context: None,
            constraints: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaSpec {
        serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "intent": { "type": "string" },
                "fields": { "type": "array" }
            },
            "required": ["intent"]
        }))
        .unwrap()
    }

    #[test]
    fn test_schema_accepts_valid_object() {
        let issues = schema().check(&json!({"intent": "billing", "fields": ["order_id"]}));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_schema_reports_missing_required() {
        let issues = schema().check(&json!({"fields": []}));
        assert_eq!(issues, vec!["missing required property 'intent'"]);
    }

    #[test]
    fn test_schema_reports_wrong_property_type() {
        let issues = schema().check(&json!({"intent": 7}));
        assert!(issues
            .iter()
            .any(|i| i == "property 'intent' is not of type 'string'"));
    }

    #[test]
    fn test_schema_reports_wrong_top_level_type() {
        let issues = schema().check(&json!([1, 2]));
        assert!(issues.iter().any(|i| i.contains("top-level type")));
    }

    #[test]
    fn test_schema_ignores_extra_properties() {
        let issues = schema().check(&json!({"intent": "x", "surplus": true}));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_schema_unknown_keys_in_document_tolerated() {
        // The subset is permissive: unknown schema keywords parse fine.
        let spec: SchemaSpec = serde_json::from_value(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": { "a": { "type": "string", "minLength": 3 } }
        }))
        .unwrap();
        assert!(spec.check(&json!({"a": "xy"})).is_empty());
    }

    #[test]
    fn test_agent_default_system_prompt() {
        let spec = AgentSpec {
            name: "Writer".into(),
            policy: "demo".into(),
            system: None,
            tools: vec![],
            input_schema: None,
            output_schema: None,
        };
        assert_eq!(spec.system_prompt(), DEFAULT_SYSTEM);
    }

    #[test]
    fn test_registry_insert_value_and_get() {
        let mut registry = AgentRegistry::new();
        registry
            .insert_value(json!({
                "name": "Triage",
                "policy": "demo",
                "tools": ["http_fetch"]
            }))
            .unwrap();

        let spec = registry.get("Triage").unwrap();
        assert!(spec.has_tool("http_fetch"));
        assert!(registry.get("Absent").is_err());
    }

    #[test]
    fn test_envelope_round_trip_camel_case() {
        let env = TaskEnvelope::new(
            "t-1",
            "Triage",
            "demo",
            HopBudget {
                tokens: 1000,
                cost_usd: 0.05,
                time_ms: 4000,
            },
            json!({"text": "hi"}),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["envelopeVersion"], "1");
        assert_eq!(value["taskId"], "t-1");
        assert_eq!(value["budget"]["costUsd"], 0.05);
        assert!(value.get("parentId").is_none());

        let back: TaskEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.agent, "Triage");
        assert_eq!(back.budget.time_ms, 4000);
    }
}

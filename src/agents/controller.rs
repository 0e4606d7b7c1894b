//! Envelope-driven hop execution.
//!
//! One hop: resolve the agent, validate the input, pre-fetch tool data,
//! call the model with a two-message strict-JSON conversation, extract the
//! last balanced JSON object from the captured stream, validate the output
//! (non-fatally), and write the hop's receipt and trace with the
//! envelope's task/parent lineage.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::agents::{http_fetch, AgentSpec, HopBudget, TaskEnvelope};
use crate::error::PilotError;
use crate::gateway::sse::CaptureSink;
use crate::gateway::Message;
use crate::receipts::{sha256_hex, Receipt, ReceiptDraft, TraceSample};
use crate::router::{RoutePlan, RouteRequest, RouteSupervisor, SupervisorSettings};
use crate::PilotCtx;

const DEFAULT_PROMPT_TOKENS: u32 = 300;
const DEFAULT_COMPLETION_TOKENS: u32 = 200;

/// What one hop produced.
#[derive(Debug, Clone)]
pub struct HopOutcome {
    pub output: Value,
    /// Absent in dry runs.
    pub receipt: Option<Receipt>,
    pub over_budget: bool,
}

impl HopOutcome {
    pub fn receipt_id(&self) -> Option<String> {
        self.receipt.as_ref().map(|r| r.id.clone())
    }
}

/// Executes typed agents against the registry.
pub struct AgentController<'a> {
    ctx: &'a PilotCtx,
}

impl<'a> AgentController<'a> {
    pub fn new(ctx: &'a PilotCtx) -> Self {
        Self { ctx }
    }

    pub fn ctx(&self) -> &PilotCtx {
        self.ctx
    }

    /// Run one hop under the envelope's contract.
    pub async fn run_hop(&self, env: &TaskEnvelope) -> Result<HopOutcome, PilotError> {
        let spec = self.ctx.agents.get(&env.agent)?;

        // Pre-flight: input must match the declared shape.
        if let Some(ref schema) = spec.input_schema {
            let issues = schema.check(&env.input);
            if !issues.is_empty() {
                return Err(PilotError::Agent {
                    agent: env.agent.clone(),
                    message: format!("input schema mismatch: {}", issues.join("; ")),
                });
            }
        }

        if self.ctx.config.dry_run {
            debug!(agent = %env.agent, "Dry run: returning stub output");
            return Ok(HopOutcome {
                output: dry_run_stub(&env.agent),
                receipt: None,
                over_budget: false,
            });
        }

        let tool_results = self.prefetch_tools(spec, env).await?;

        let policy = self.ctx.policies.get(&env.policy)?;

        let user_message = build_user_message(env, tool_results);
        let messages = vec![
            Message::system(spec.system_prompt()),
            Message::user(user_message.clone()),
        ];

        let mut settings = SupervisorSettings::from_policy(policy);
        if env.budget.time_ms > 0 {
            // The hop's wall-time budget becomes the stall cutoff.
            settings = settings.with_stall(env.budget.time_ms);
        }

        let plan = RoutePlan::from_policy(policy);
        let route_primary = plan.primary[0].clone();
        let route_req = RouteRequest {
            plan,
            policy,
            settings,
            messages,
            force_json: true,
        };
        let supervisor = RouteSupervisor::new(
            &self.ctx.gateway,
            &self.ctx.recorder,
            self.ctx.config.chaos,
        );

        let mut sink = CaptureSink::new();
        let outcome = supervisor.run(&route_req, &mut sink).await?;
        let captured = sink.into_string();

        let output =
            extract_last_json_object(&captured).ok_or_else(|| PilotError::Agent {
                agent: env.agent.clone(),
                message: "no balanced JSON object in model output".into(),
            })?;

        // Post-flight: output mismatches warn but do not fail the hop.
        if let Some(ref schema) = spec.output_schema {
            for issue in schema.check(&output) {
                warn!(agent = %env.agent, issue = %issue, "Output schema mismatch");
            }
        }

        let prompt_tokens = outcome.usage_prompt.unwrap_or(DEFAULT_PROMPT_TOKENS);
        let completion_tokens = outcome.usage_completion.unwrap_or(DEFAULT_COMPLETION_TOKENS);
        let cost_usd = self.ctx.rates.estimate_cost(
            &outcome.route_final,
            prompt_tokens,
            completion_tokens,
        );
        let over = over_budget(
            &env.budget,
            cost_usd,
            outcome.latency_ms,
            outcome.fallback_count,
        );

        let mut meta = Map::new();
        if over {
            meta.insert("over_budget".into(), Value::Bool(true));
        }

        let receipt = self.ctx.recorder.record(ReceiptDraft {
            policy: env.policy.clone(),
            route_primary: route_primary.clone(),
            route_final: outcome.route_final.clone(),
            fallback_count: outcome.fallback_count,
            reasons: outcome.reasons.clone(),
            latency_ms: outcome.latency_ms,
            first_token_ms: outcome.first_token_ms,
            task_id: Some(env.task_id.clone()),
            parent_id: env.parent_id.clone(),
            agent: Some(env.agent.clone()),
            prompt_tokens,
            completion_tokens,
            cost_usd,
            prompt_hash: sha256_hex(&user_message),
            policy_hash: policy.canonical_hash(),
            meta: Value::Object(meta),
        })?;

        self.ctx.recorder.record_trace(&TraceSample {
            user_ref: None,
            policy: env.policy.clone(),
            route_primary,
            route_final: outcome.route_final.clone(),
            latency_ms: outcome.latency_ms,
            tokens: u64::from(prompt_tokens) + u64::from(completion_tokens),
            cost_usd,
        })?;

        Ok(HopOutcome {
            output,
            receipt: Some(receipt),
            over_budget: over,
        })
    }

    /// http_fetch pre-fetch: needs the tool listed, an `ids[]` input array,
    /// and a configured URL template.
    async fn prefetch_tools(
        &self,
        spec: &AgentSpec,
        env: &TaskEnvelope,
    ) -> Result<Option<Value>, PilotError> {
        if !spec.has_tool("http_fetch") {
            return Ok(None);
        }
        let Some(ids) = env.input.get("ids").and_then(Value::as_array) else {
            return Ok(None);
        };
        let fetched = http_fetch::prefetch_ids(&self.ctx.http, &self.ctx.config.http_fetch, ids)
            .await?;
        Ok(fetched.map(|entries| json!({ "http_fetch": entries })))
    }
}

/// The serialized user message for one hop.
fn build_user_message(env: &TaskEnvelope, tool_results: Option<Value>) -> String {
    let mut body = Map::new();
    body.insert("input".into(), env.input.clone());
    if let Some(ref context) = env.context {
        body.insert("context".into(), context.clone());
    }
    if let Some(ref constraints) = env.constraints {
        body.insert("constraints".into(), constraints.clone());
    }
    if let Some(results) = tool_results {
        body.insert("tool_results".into(), results);
    }
    Value::Object(body).to_string()
}

/// Deterministic stub keyed by the agent name family.
fn dry_run_stub(agent: &str) -> Value {
    if agent.contains("Triage") {
        json!({ "intent": "dry-run", "fields": [] })
    } else if agent.contains("Retriever") {
        json!({ "records": [] })
    } else if agent.contains("Writer") {
        json!({ "draft": "" })
    } else if agent.contains("Aggregator") {
        json!({ "records": [] })
    } else {
        json!({})
    }
}

fn over_budget(budget: &HopBudget, cost_usd: f64, latency_ms: u64, fallback_count: u32) -> bool {
    cost_usd > budget.cost_usd || latency_ms > budget.time_ms || fallback_count >= 2
}

/// Extract the last balanced top-level JSON object from free-form text.
///
/// Scans for `{`, finds the matching close with string-awareness, and keeps
/// the last candidate that parses. Unparseable candidates are re-entered
/// one byte in, so prose braces around a real object do not hide it.
pub fn extract_last_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut last = None;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = find_balanced_end(bytes, i) {
                if let Ok(value) = serde_json::from_slice::<Value>(&bytes[i..=end]) {
                    if value.is_object() {
                        last = Some(value);
                        i = end + 1;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }

    last
}

fn find_balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

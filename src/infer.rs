//! Single-request inference driver.
//!
//! Order matters: quota gate, router, usage reconciliation, receipt, daily
//! token accounting, trace. A failure at any step stops everything below
//! it, so a crash after the gateway call but before the ledger update
//! cannot skew the p95 window with a partial latency. The trace is written
//! last for the same reason.

use serde_json::json;
use tracing::debug;

use crate::error::PilotError;
use crate::gateway::sse::{CaptureSink, DeltaSink};
use crate::gateway::{ChatCall, Message};
use crate::policy::Policy;
use crate::receipts::{sha256_hex, Receipt, ReceiptDraft, TraceSample};
use crate::router::{RoutePlan, RouteOutcome, RouteRequest, RouteSupervisor, SupervisorSettings};
use crate::PilotCtx;

/// Usage fallback when the gateway reports nothing and probing is off.
const DEFAULT_PROMPT_TOKENS: u32 = 300;
const DEFAULT_COMPLETION_TOKENS: u32 = 200;

/// One inference request.
#[derive(Debug, Clone)]
pub struct InferRequest<'a> {
    pub user: &'a str,
    pub policy: &'a str,
    pub prompt: &'a str,
    /// Pre-extracted attachment block, if any (extraction is a caller concern).
    pub attachment: Option<&'a str>,
    /// Model for an optional silent shadow run after the main path.
    pub shadow: Option<&'a str>,
}

/// What one inference produced.
#[derive(Debug, Clone)]
pub struct InferReport {
    pub receipt: Receipt,
    pub outcome: RouteOutcome,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}

/// Drives one supervised completion end to end.
pub struct InferenceDriver<'a> {
    ctx: &'a PilotCtx,
}

impl<'a> InferenceDriver<'a> {
    pub fn new(ctx: &'a PilotCtx) -> Self {
        Self { ctx }
    }

    pub async fn infer(
        &self,
        req: &InferRequest<'_>,
        sink: &mut dyn DeltaSink,
    ) -> Result<InferReport, PilotError> {
        let policy = self.ctx.policies.get(req.policy)?;
        let policy_hash = policy.canonical_hash();

        self.ctx
            .quota
            .assert_within_rpm(req.user, policy.tenancy.per_user_rpm)?;

        let (messages, prompt_hash) = build_messages(policy, req.prompt, req.attachment);

        if self.ctx.config.snapshot_input {
            let doc = serde_json::to_value(&messages)?;
            self.ctx
                .recorder
                .mirror_document(&format!("input-{}.json", &prompt_hash[..12]), &doc)?;
        }

        let plan = RoutePlan::from_policy(policy);
        let route_primary = plan.primary[0].clone();
        let route_req = RouteRequest {
            plan,
            policy,
            settings: SupervisorSettings::from_policy(policy),
            messages: messages.clone(),
            force_json: false,
        };
        let supervisor = RouteSupervisor::new(
            &self.ctx.gateway,
            &self.ctx.recorder,
            self.ctx.config.chaos,
        );
        let outcome = supervisor.run(&route_req, sink).await?;

        let (prompt_tokens, completion_tokens) =
            self.reconcile_usage(&outcome, &messages, policy).await;
        let cost_usd =
            self.ctx
                .rates
                .estimate_cost(&outcome.route_final, prompt_tokens, completion_tokens);

        let receipt = self.ctx.recorder.record(ReceiptDraft {
            policy: req.policy.to_string(),
            route_primary: route_primary.clone(),
            route_final: outcome.route_final.clone(),
            fallback_count: outcome.fallback_count,
            reasons: outcome.reasons.clone(),
            latency_ms: outcome.latency_ms,
            first_token_ms: outcome.first_token_ms,
            task_id: None,
            parent_id: None,
            agent: None,
            prompt_tokens,
            completion_tokens,
            cost_usd,
            prompt_hash,
            policy_hash: policy_hash.clone(),
            meta: json!({}),
        })?;

        // Accounting can still trip the daily cap for a request whose bytes
        // already streamed; the receipt above survives, the trace does not.
        self.ctx.quota.add_daily_tokens(
            req.user,
            u64::from(prompt_tokens) + u64::from(completion_tokens),
            policy.tenancy.per_user_daily_tokens,
            &policy.tenancy.timezone,
        )?;

        self.ctx.recorder.record_trace(&TraceSample {
            user_ref: Some(req.user.to_string()),
            policy: req.policy.to_string(),
            route_primary,
            route_final: outcome.route_final.clone(),
            latency_ms: outcome.latency_ms,
            tokens: u64::from(prompt_tokens) + u64::from(completion_tokens),
            cost_usd,
        })?;

        if let Some(shadow_model) = req.shadow {
            self.shadow_run(shadow_model, &messages, policy, req.policy, &policy_hash)
                .await;
        }

        Ok(InferReport {
            receipt,
            outcome,
            prompt_tokens,
            completion_tokens,
            cost_usd,
        })
    }

    /// Header counts win; otherwise the optional non-stream probe; otherwise
    /// the coarse constants. Not billing-grade and not meant to be.
    async fn reconcile_usage(
        &self,
        outcome: &RouteOutcome,
        messages: &[Message],
        policy: &Policy,
    ) -> (u32, u32) {
        if outcome.usage_prompt.is_some() || outcome.usage_completion.is_some() {
            return (
                outcome.usage_prompt.unwrap_or(DEFAULT_PROMPT_TOKENS),
                outcome.usage_completion.unwrap_or(DEFAULT_COMPLETION_TOKENS),
            );
        }

        if self.ctx.config.usage_probe {
            let call = ChatCall::new(
                outcome.route_final.clone(),
                messages.to_vec(),
                policy.objectives.max_tokens,
            );
            match self.ctx.gateway.probe_usage(&call).await {
                Ok(usage) => return (usage.prompt_tokens, usage.completion_tokens),
                Err(e) => debug!(error = %e, "Usage probe failed, using defaults"),
            }
        }

        (DEFAULT_PROMPT_TOKENS, DEFAULT_COMPLETION_TOKENS)
    }

    /// Silent comparison run on an alternate model. Single attempt, no
    /// backups, no user-visible output; failures are swallowed.
    async fn shadow_run(
        &self,
        model: &str,
        messages: &[Message],
        policy: &Policy,
        policy_name: &str,
        policy_hash: &str,
    ) {
        let route_req = RouteRequest {
            plan: RoutePlan::solo(model),
            policy,
            settings: SupervisorSettings::from_policy(policy).single_attempt(),
            messages: messages.to_vec(),
            force_json: false,
        };
        let supervisor = RouteSupervisor::new(
            &self.ctx.gateway,
            &self.ctx.recorder,
            self.ctx.config.chaos,
        );

        let mut sink = CaptureSink::new();
        let outcome = match supervisor.run(&route_req, &mut sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(model = %model, error = %e, "Shadow run failed (ignored)");
                return;
            }
        };

        let marker = ReceiptDraft {
            policy: policy_name.to_string(),
            route_primary: model.to_string(),
            route_final: outcome.route_final,
            fallback_count: 0,
            reasons: vec!["shadow".into()],
            latency_ms: 0,
            first_token_ms: None,
            task_id: None,
            parent_id: None,
            agent: None,
            prompt_tokens: outcome.usage_prompt.unwrap_or(0),
            completion_tokens: 0,
            cost_usd: 0.0,
            prompt_hash: String::new(),
            policy_hash: policy_hash.to_string(),
            meta: json!({ "shadow": true }),
        };
        if let Err(e) = self.ctx.recorder.record(marker) {
            debug!(model = %model, error = %e, "Shadow receipt write failed (ignored)");
        }
    }
}

/// Build the message list and the prompt hash.
///
/// The hash covers the user content concatenated with the attachment block
/// (separated by a blank line) when one is present.
pub fn build_messages(
    policy: &Policy,
    prompt: &str,
    attachment: Option<&str>,
) -> (Vec<Message>, String) {
    let mut messages = Vec::new();
    if let Some(system) = policy.gen.as_ref().and_then(|g| g.system.as_deref()) {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));

    let prompt_hash = match attachment {
        Some(block) => {
            messages.push(Message::user(block));
            sha256_hex(&format!("{prompt}\n\n{block}"))
        }
        None => sha256_hex(prompt),
    };

    (messages, prompt_hash)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Role;
    use serde_json::json;

    fn policy() -> Policy {
        Policy::from_value(
            "demo",
            json!({
                "objectives": { "p95_latency_ms": 1000, "max_cost_usd": 1.0, "max_tokens": 256 },
                "routing": { "primary": ["alpha"], "backups": [] },
                "strategy": {
                    "fallback_on_latency_ms": 1000,
                    "max_attempts": 1,
                    "backoff_ms": [10]
                },
                "tenancy": { "per_user_daily_tokens": 1000, "per_user_rpm": 10 },
                "gen": { "system": "Be terse." }
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_build_messages_without_attachment() {
        let (messages, hash) = build_messages(&policy(), "hello", None);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "hello");
        assert_eq!(hash, sha256_hex("hello"));
    }

    #[test]
    fn test_build_messages_with_attachment() {
        let (messages, hash) = build_messages(&policy(), "hello", Some("FILE: x"));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "FILE: x");
        assert_eq!(hash, sha256_hex("hello\n\nFILE: x"));
    }

    #[test]
    fn test_build_messages_no_system_without_gen() {
        let mut p = policy();
        p.gen = None;
        let (messages, _) = build_messages(&p, "hello", None);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}

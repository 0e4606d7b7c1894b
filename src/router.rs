//! Route supervisor.
//!
//! Builds the route ladder (with the p95 pre-pick reorder), walks it under
//! an attempt budget, supervises each streamed attempt with a stall timer
//! and a first-chunk gate, classifies failures, sleeps the backoff ladder
//! between attempts, and returns a filled result record or an aggregated
//! error naming every attempt.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::ChaosFlags;
use crate::error::{AttemptFailure, PilotError};
use crate::gateway::headers::{usage_from_headers, HeaderUsage};
use crate::gateway::sse::{DeltaSink, DeltaStream, StreamEvent};
use crate::gateway::{ChatCall, GatewayClient, Message};
use crate::policy::Policy;
use crate::receipts::ReceiptRecorder;

/// Minimum trace samples before the pre-pick reorder may trigger.
const PREPICK_MIN_SAMPLES: usize = 10;

/// The ordered models the supervisor may try.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub primary: Vec<String>,
    pub backups: Vec<String>,
}

impl RoutePlan {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            primary: policy.routing.primary.clone(),
            backups: policy.routing.backups.clone(),
        }
    }

    /// A single-model plan with no backups (shadow runs).
    pub fn solo(model: &str) -> Self {
        Self {
            primary: vec![model.to_string()],
            backups: Vec::new(),
        }
    }
}

/// Supervision knobs, usually lifted straight from a policy's strategy.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub target_p95_ms: u64,
    pub window_n: usize,
    pub max_tokens: u32,
    pub stall_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
    pub first_chunk_gate_ms: u64,
    pub escalate_after_fallbacks: u32,
}

impl SupervisorSettings {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            target_p95_ms: policy.objectives.p95_latency_ms,
            window_n: policy.routing.p95_window_n,
            max_tokens: policy.objectives.max_tokens,
            stall_ms: policy.strategy.fallback_on_latency_ms,
            max_attempts: policy.strategy.max_attempts,
            backoff_ms: policy.strategy.backoff_ms.clone(),
            first_chunk_gate_ms: policy.strategy.first_chunk_gate_ms,
            escalate_after_fallbacks: policy.strategy.escalate_after_fallbacks,
        }
    }

    /// Override the stall cutoff (per-hop time budgets).
    pub fn with_stall(mut self, stall_ms: u64) -> Self {
        self.stall_ms = stall_ms;
        self
    }

    /// Restrict to a single attempt (shadow runs).
    pub fn single_attempt(mut self) -> Self {
        self.max_attempts = 1;
        self
    }
}

/// One supervised routing call.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub plan: RoutePlan,
    pub policy: &'a Policy,
    pub settings: SupervisorSettings,
    pub messages: Vec<Message>,
    /// Force `json_mode` regardless of policy params (sub-agent hops).
    pub force_json: bool,
}

/// The filled result of a successful supervised call.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub route_final: String,
    pub fallback_count: u32,
    pub latency_ms: u64,
    pub first_token_ms: Option<u64>,
    pub reasons: Vec<String>,
    pub usage_prompt: Option<u32>,
    pub usage_completion: Option<u32>,
}

// ---------------------------------------------------------------------------
// Attempt failure classification
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum AttemptFail {
    Stall,
    Gateway { status: u16, body: String },
    Error(String),
}

impl AttemptFail {
    fn reason(&self) -> String {
        match self {
            Self::Stall => "stall".into(),
            Self::Gateway { status: 429, .. } => "rate_limit".into(),
            Self::Gateway { status, .. } if *status >= 500 => "5xx".into(),
            Self::Gateway { status, .. } => format!("http_{status}"),
            Self::Error(_) => "error".into(),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Stall => "no first delta before stall cutoff".into(),
            Self::Gateway { status, body } => format!("gateway status {status}: {body}"),
            Self::Error(message) => message.clone(),
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Gateway { status, .. } => Some(*status),
            _ => None,
        }
    }
}

struct AttemptSuccess {
    first_token_ms: Option<u64>,
    usage: HeaderUsage,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Walks a route ladder under supervision.
pub struct RouteSupervisor<'a> {
    gateway: &'a GatewayClient,
    recorder: &'a ReceiptRecorder,
    chaos: ChaosFlags,
}

impl<'a> RouteSupervisor<'a> {
    pub fn new(
        gateway: &'a GatewayClient,
        recorder: &'a ReceiptRecorder,
        chaos: ChaosFlags,
    ) -> Self {
        Self {
            gateway,
            recorder,
            chaos,
        }
    }

    /// Build the ladder, applying the p95 pre-pick when the lead primary's
    /// recent p95 misses the target on enough samples.
    pub fn build_ladder(
        &self,
        plan: &RoutePlan,
        target_p95_ms: u64,
        window: usize,
    ) -> Result<Vec<String>, PilotError> {
        let mut ladder: Vec<String> = plan
            .primary
            .iter()
            .chain(plan.backups.iter())
            .cloned()
            .collect();

        let Some(lead) = plan.primary.first() else {
            return Ok(ladder);
        };
        let Some(lead_p95) = self.recorder.p95_latency_for(lead, window)? else {
            return Ok(ladder);
        };
        if self.recorder.sample_count_for(lead, window)? < PREPICK_MIN_SAMPLES
            || lead_p95 <= target_p95_ms
        {
            return Ok(ladder);
        }

        // Lowest observed backup p95; strict < keeps the earliest position
        // on ties.
        let mut best: Option<(u64, usize)> = None;
        for (pos, backup) in plan.backups.iter().enumerate() {
            if let Some(p95) = self.recorder.p95_latency_for(backup, window)? {
                if best.map_or(true, |(current, _)| p95 < current) {
                    best = Some((p95, pos));
                }
            }
        }

        if let Some((backup_p95, pos)) = best {
            let chosen = plan.backups[pos].clone();
            info!(
                primary = %lead,
                primary_p95_ms = lead_p95,
                prepick = %chosen,
                prepick_p95_ms = backup_p95,
                target_p95_ms,
                "Pre-pick: reordering ladder"
            );
            let mut reordered = vec![chosen.clone()];
            reordered.extend(plan.primary.iter().cloned());
            reordered.extend(plan.backups.iter().filter(|b| **b != chosen).cloned());
            ladder = reordered;
        }

        Ok(ladder)
    }

    /// Run the supervised call, forwarding deltas to `sink`.
    pub async fn run(
        &self,
        req: &RouteRequest<'_>,
        sink: &mut dyn DeltaSink,
    ) -> Result<RouteOutcome, PilotError> {
        let ladder = self.build_ladder(
            &req.plan,
            req.settings.target_p95_ms,
            req.settings.window_n,
        )?;
        let attempt_cap = (req.settings.max_attempts as usize).min(ladder.len());

        let started = Instant::now();
        let mut reasons: Vec<String> = Vec::new();
        let mut attempts_log: Vec<AttemptFailure> = Vec::new();
        let mut fallback_count = 0u32;
        let mut escalated = false;

        for (position, model) in ladder.iter().take(attempt_cap).enumerate() {
            let is_primary = req.plan.primary.first() == Some(model);
            debug!(model = %model, position, "Attempting route");

            match self.attempt(model, is_primary, req, sink).await {
                Ok(success) => {
                    let outcome = RouteOutcome {
                        route_final: model.clone(),
                        fallback_count,
                        latency_ms: started.elapsed().as_millis() as u64,
                        first_token_ms: success.first_token_ms,
                        reasons,
                        usage_prompt: success.usage.prompt,
                        usage_completion: success.usage.completion,
                    };
                    info!(
                        model = %model,
                        latency_ms = outcome.latency_ms,
                        fallbacks = outcome.fallback_count,
                        "Route succeeded"
                    );
                    return Ok(outcome);
                }
                Err(fail) => {
                    let reason = fail.reason();
                    warn!(model = %model, reason = %reason, "Attempt failed, advancing route");
                    reasons.push(reason);
                    attempts_log.push(AttemptFailure {
                        model: model.clone(),
                        message: fail.message(),
                        status: fail.status(),
                    });
                    fallback_count += 1;

                    if !escalated && fallback_count >= req.settings.escalate_after_fallbacks {
                        escalated = true;
                        warn!(
                            escalation = true,
                            fallbacks = fallback_count,
                            primary = ?req.plan.primary.first(),
                            "Escalation: repeated fallbacks on this request"
                        );
                    }

                    if position + 1 < attempt_cap {
                        let delay = backoff_delay(&req.settings.backoff_ms, fallback_count);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(PilotError::Router {
            attempts: attempts_log,
        })
    }

    async fn attempt(
        &self,
        model: &str,
        is_primary: bool,
        req: &RouteRequest<'_>,
        sink: &mut dyn DeltaSink,
    ) -> Result<AttemptSuccess, AttemptFail> {
        let settings = &req.settings;
        let attempt_start = Instant::now();
        let stall = tokio::time::sleep(Duration::from_millis(settings.stall_ms));
        tokio::pin!(stall);

        if is_primary && self.chaos.primary_stall {
            tokio::time::sleep(Duration::from_millis(settings.stall_ms + 50)).await;
            return Err(AttemptFail::Stall);
        }
        if is_primary && self.chaos.http_5xx {
            return Err(AttemptFail::Gateway {
                status: 503,
                body: "chaos: injected 503".into(),
            });
        }

        let mut gen = req.policy.merged_params(model);
        if req.force_json {
            gen.json_mode = Some(true);
        }
        let call =
            ChatCall::new(model, req.messages.clone(), settings.max_tokens).with_gen(&gen);

        // The stall timer spans the request itself: a gateway that never
        // answers is indistinguishable from one that never streams.
        let response = tokio::select! {
            () = &mut stall => return Err(AttemptFail::Stall),
            result = self.gateway.chat_stream(&call) => match result {
                Ok(response) => response,
                Err(PilotError::Gateway { status, body }) => {
                    return Err(AttemptFail::Gateway { status, body })
                }
                Err(other) => return Err(AttemptFail::Error(other.to_string())),
            },
        };

        let usage = usage_from_headers(response.headers());
        let mut stream = Box::pin(DeltaStream::new(response.bytes_stream()));

        let gate_ms = settings.first_chunk_gate_ms;
        let mut first_token_ms: Option<u64> = None;
        let mut gate_deadline: Option<Instant> = None;
        let mut pending = String::new();

        loop {
            tokio::select! {
                () = &mut stall, if first_token_ms.is_none() => {
                    return Err(AttemptFail::Stall);
                }
                event = stream.next() => match event {
                    Some(Ok(StreamEvent::Delta(delta))) => {
                        if first_token_ms.is_none() {
                            // A delta arrived, so the elapsed time is nonzero
                            // even when the clock reads under a millisecond.
                            first_token_ms =
                                Some((attempt_start.elapsed().as_millis() as u64).max(1));
                            if gate_ms > 0 {
                                gate_deadline =
                                    Some(Instant::now() + Duration::from_millis(gate_ms));
                            }
                        }

                        let gate_open =
                            gate_deadline.map_or(true, |deadline| Instant::now() >= deadline);
                        if gate_open {
                            if !pending.is_empty() {
                                sink.write(&pending);
                                pending.clear();
                            }
                            sink.write(&delta);
                        } else {
                            // Held back so a late stall can be reclassified
                            // without torn output.
                            pending.push_str(&delta);
                        }
                    }
                    Some(Ok(StreamEvent::Done)) | None => {
                        if first_token_ms.is_none() {
                            // Completed without a single content delta.
                            return Err(AttemptFail::Stall);
                        }
                        if !pending.is_empty() {
                            sink.write(&pending);
                        }
                        return Ok(AttemptSuccess {
                            first_token_ms,
                            usage,
                        });
                    }
                    Some(Err(e)) => return Err(AttemptFail::Error(e.to_string())),
                },
            }
        }
    }
}

/// Backoff for the n-th fallback (1-based); the last ladder entry repeats.
fn backoff_delay(backoff_ms: &[u64], fallback_count: u32) -> u64 {
    if backoff_ms.is_empty() {
        return 0;
    }
    let idx = (fallback_count.saturating_sub(1) as usize).min(backoff_ms.len() - 1);
    backoff_ms[idx]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

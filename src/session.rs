//! Multi-turn agent sessions.
//!
//! A session pins a user, an agent definition, and a policy; each turn
//! replays up to the last 50 history messages, streams the reply through a
//! capturing sink, persists both sides of the exchange, and updates quotas
//! and traces. Per-turn receipts are optional and chain through
//! `parent_id` under `task_id = session_id`.

use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::error::PilotError;
use crate::gateway::sse::{DeltaSink, TeeSink};
use crate::gateway::{Message, Role};
use crate::receipts::{sha256_hex, ReceiptDraft, TraceSample};
use crate::router::{RoutePlan, RouteRequest, RouteSupervisor, SupervisorSettings};
use crate::PilotCtx;

/// History window replayed into each turn.
const HISTORY_WINDOW: usize = 50;

const DEFAULT_PROMPT_TOKENS: u32 = 300;
const DEFAULT_COMPLETION_TOKENS: u32 = 200;

/// One persisted session row.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: String,
    pub user_ref: String,
    pub agent_name: String,
    pub policy_name: String,
}

/// What one turn produced.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub session_id: String,
    pub reply: String,
    pub route_final: String,
    pub receipt_id: Option<String>,
}

/// Drives multi-turn chat with persisted history.
pub struct SessionDriver<'a> {
    ctx: &'a PilotCtx,
}

impl<'a> SessionDriver<'a> {
    pub fn new(ctx: &'a PilotCtx) -> Self {
        Self { ctx }
    }

    /// Create a session and return its id.
    pub fn open(
        &self,
        user: &str,
        agent_name: &str,
        policy_name: &str,
    ) -> Result<String, PilotError> {
        // Fail early on unknown names.
        self.ctx.agents.get(agent_name)?;
        self.ctx.policies.get(policy_name)?;

        let id = uuid::Uuid::new_v4().to_string();
        self.ctx.ledger.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_ref, agent_name, policy_name) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, user, agent_name, policy_name],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn load(&self, session_id: &str) -> Result<Session, PilotError> {
        let session = self.ctx.ledger.with_conn(|conn| {
            conn.query_row(
                "SELECT id, created_at, user_ref, agent_name, policy_name \
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        user_ref: row.get(2)?,
                        agent_name: row.get(3)?,
                        policy_name: row.get(4)?,
                    })
                },
            )
            .optional()
        })?;
        session.ok_or_else(|| PilotError::Unknown(format!("session not found: {session_id}")))
    }

    /// Sessions belonging to a user, newest first.
    pub fn sessions_for_user(&self, user: &str) -> Result<Vec<Session>, PilotError> {
        let rows = self.ctx.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, user_ref, agent_name, policy_name \
                 FROM sessions WHERE user_ref = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![user], |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        user_ref: row.get(2)?,
                        agent_name: row.get(3)?,
                        policy_name: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    /// Run one turn: gate, build messages, persist the user side, stream,
    /// persist the assistant side, account tokens, trace, optional receipt.
    pub async fn turn(
        &self,
        session_id: &str,
        input: &str,
        attachment: Option<&str>,
        write_receipt: bool,
        sink: &mut dyn DeltaSink,
    ) -> Result<TurnReport, PilotError> {
        let session = self.load(session_id)?;
        let agent = self.ctx.agents.get(&session.agent_name)?;
        let policy = self.ctx.policies.get(&session.policy_name)?;

        self.ctx
            .quota
            .assert_within_rpm(&session.user_ref, policy.tenancy.per_user_rpm)?;

        let mut messages = Vec::new();
        if let Some(system) = agent.system.as_deref() {
            messages.push(Message::system(system));
        }
        messages.extend(self.history(session_id)?);
        messages.push(Message::user(input));
        if let Some(block) = attachment {
            messages.push(Message::user(block));
        }

        self.insert_message(session_id, "user", input)?;

        let plan = RoutePlan::from_policy(policy);
        let route_primary = plan.primary[0].clone();
        let route_req = RouteRequest {
            plan,
            policy,
            settings: SupervisorSettings::from_policy(policy),
            messages,
            force_json: false,
        };
        let supervisor = RouteSupervisor::new(
            &self.ctx.gateway,
            &self.ctx.recorder,
            self.ctx.config.chaos,
        );

        let mut tee = TeeSink::new(sink);
        let outcome = supervisor.run(&route_req, &mut tee).await?;
        let reply = tee.into_captured();

        self.insert_message(session_id, "assistant", &reply)?;

        let prompt_tokens = outcome.usage_prompt.unwrap_or(DEFAULT_PROMPT_TOKENS);
        let completion_tokens = outcome.usage_completion.unwrap_or(DEFAULT_COMPLETION_TOKENS);
        let cost_usd = self.ctx.rates.estimate_cost(
            &outcome.route_final,
            prompt_tokens,
            completion_tokens,
        );

        let receipt_id = if write_receipt {
            let parent_id = self
                .ctx
                .recorder
                .latest_for_task(session_id)?
                .map(|r| r.id);
            let receipt = self.ctx.recorder.record(ReceiptDraft {
                policy: session.policy_name.clone(),
                route_primary: route_primary.clone(),
                route_final: outcome.route_final.clone(),
                fallback_count: outcome.fallback_count,
                reasons: outcome.reasons.clone(),
                latency_ms: outcome.latency_ms,
                first_token_ms: outcome.first_token_ms,
                task_id: Some(session_id.to_string()),
                parent_id,
                agent: Some(session.agent_name.clone()),
                prompt_tokens,
                completion_tokens,
                cost_usd,
                prompt_hash: sha256_hex(input),
                policy_hash: policy.canonical_hash(),
                meta: json!({}),
            })?;
            Some(receipt.id)
        } else {
            None
        };

        self.ctx.quota.add_daily_tokens(
            &session.user_ref,
            u64::from(prompt_tokens) + u64::from(completion_tokens),
            policy.tenancy.per_user_daily_tokens,
            &policy.tenancy.timezone,
        )?;

        self.ctx.recorder.record_trace(&TraceSample {
            user_ref: Some(session.user_ref.clone()),
            policy: session.policy_name.clone(),
            route_primary,
            route_final: outcome.route_final.clone(),
            latency_ms: outcome.latency_ms,
            tokens: u64::from(prompt_tokens) + u64::from(completion_tokens),
            cost_usd,
        })?;

        Ok(TurnReport {
            session_id: session_id.to_string(),
            reply,
            route_final: outcome.route_final,
            receipt_id,
        })
    }

    /// Last [`HISTORY_WINDOW`] messages in chronological order.
    fn history(&self, session_id: &str) -> Result<Vec<Message>, PilotError> {
        let mut rows = self.ctx.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content FROM messages WHERE session_id = ?1 \
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![session_id, HISTORY_WINDOW as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.reverse();

        Ok(rows
            .into_iter()
            .map(|(role, content)| Message {
                role: match role.as_str() {
                    "system" => Role::System,
                    "assistant" => Role::Assistant,
                    _ => Role::User,
                },
                content,
            })
            .collect())
    }

    fn insert_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), PilotError> {
        self.ctx.ledger.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, content) VALUES (?1, ?2, ?3)",
                params![session_id, role, content],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentSpec;
    use crate::policy::Policy;
    use crate::test_support::test_ctx;
    use serde_json::json;

    fn ctx() -> PilotCtx {
        let mut ctx = test_ctx("http://localhost:9");
        ctx.policies
            .insert(
                "chat",
                Policy::from_value(
                    "chat",
                    json!({
                        "objectives": { "p95_latency_ms": 1000, "max_cost_usd": 1.0, "max_tokens": 256 },
                        "routing": { "primary": ["alpha"], "backups": [] },
                        "strategy": {
                            "fallback_on_latency_ms": 500,
                            "max_attempts": 1,
                            "backoff_ms": [10]
                        },
                        "tenancy": { "per_user_daily_tokens": 100_000, "per_user_rpm": 100 }
                    }),
                )
                .unwrap(),
            )
            .unwrap();
        ctx.agents.insert(AgentSpec {
            name: "Helper".into(),
            policy: "chat".into(),
            system: Some("You are helpful.".into()),
            tools: vec![],
            input_schema: None,
            output_schema: None,
        });
        ctx
    }

    #[test]
    fn test_open_and_load_session() {
        let ctx = ctx();
        let driver = SessionDriver::new(&ctx);
        let id = driver.open("alice", "Helper", "chat").unwrap();

        let session = driver.load(&id).unwrap();
        assert_eq!(session.user_ref, "alice");
        assert_eq!(session.agent_name, "Helper");
        assert_eq!(session.policy_name, "chat");
    }

    #[test]
    fn test_open_rejects_unknown_agent() {
        let ctx = ctx();
        let driver = SessionDriver::new(&ctx);
        assert!(driver.open("alice", "Nobody", "chat").is_err());
    }

    #[test]
    fn test_load_missing_session_errors() {
        let ctx = ctx();
        let driver = SessionDriver::new(&ctx);
        assert!(driver.load("no-such-id").is_err());
    }

    #[test]
    fn test_sessions_for_user() {
        let ctx = ctx();
        let driver = SessionDriver::new(&ctx);
        driver.open("alice", "Helper", "chat").unwrap();
        driver.open("alice", "Helper", "chat").unwrap();
        driver.open("bob", "Helper", "chat").unwrap();

        assert_eq!(driver.sessions_for_user("alice").unwrap().len(), 2);
        assert_eq!(driver.sessions_for_user("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_history_window_caps_at_50() {
        let ctx = ctx();
        let driver = SessionDriver::new(&ctx);
        let id = driver.open("alice", "Helper", "chat").unwrap();

        for i in 0..60 {
            driver
                .insert_message(&id, "user", &format!("message {i}"))
                .unwrap();
        }

        let history = driver.history(&id).unwrap();
        assert_eq!(history.len(), 50);
        // Oldest surviving message is number 10.
        assert_eq!(history[0].content, "message 10");
        assert_eq!(history[49].content, "message 59");
    }

    #[test]
    fn test_history_preserves_roles() {
        let ctx = ctx();
        let driver = SessionDriver::new(&ctx);
        let id = driver.open("alice", "Helper", "chat").unwrap();
        driver.insert_message(&id, "user", "hi").unwrap();
        driver.insert_message(&id, "assistant", "hello").unwrap();

        let history = driver.history(&id).unwrap();
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }
}

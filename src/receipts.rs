//! Receipts and traces.
//!
//! A receipt is the immutable, signed record of one completed invocation.
//! The recorder builds the canonical payload, optionally redacts it, signs
//! the post-redaction JSON with HMAC-SHA-256, persists it, and can mirror a
//! pretty copy to a file tree. Traces are the lightweight latency samples
//! behind the router's p95 pre-pick.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::RuntimeConfig;
use crate::db::Ledger;
use crate::error::PilotError;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of a string, hex encoded. Used for prompt and policy hashes.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// HMAC-SHA-256 of `payload` under `secret`, hex encoded.
pub fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a signature against a payload.
pub fn verify_signature(secret: &str, payload: &str, signature: &str) -> bool {
    sign_payload(secret, payload) == signature
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

// Seven or more digits with up to two separator characters between each
// pair counts as phone-like.
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d(?:[\s().-]{0,2}\d){6,}").unwrap());

/// Scrub one string: emails first (they may contain digits), then
/// phone-like runs. Replacement markers contain neither, so the scrub is
/// idempotent.
pub fn redact_text(text: &str) -> String {
    let pass = EMAIL_RE.replace_all(text, "[redacted-email]");
    PHONE_RE.replace_all(&pass, "[redacted-phone]").into_owned()
}

/// Recursively scrub every string in a JSON value; keys named in
/// `blocked_keys` have their whole value replaced.
pub fn redact_value(value: &mut Value, blocked_keys: &[String]) {
    match value {
        Value::String(s) => {
            let scrubbed = redact_text(s);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, blocked_keys);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if blocked_keys.iter().any(|b| b == key) {
                    *item = Value::String("[redacted]".into());
                } else {
                    redact_value(item, blocked_keys);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Receipt model
// ---------------------------------------------------------------------------

/// Inputs for one receipt; the recorder assigns id, ts, and signature.
#[derive(Debug, Clone)]
pub struct ReceiptDraft {
    pub policy: String,
    pub route_primary: String,
    pub route_final: String,
    pub fallback_count: u32,
    pub reasons: Vec<String>,
    pub latency_ms: u64,
    pub first_token_ms: Option<u64>,
    pub task_id: Option<String>,
    pub parent_id: Option<String>,
    pub agent: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub prompt_hash: String,
    pub policy_hash: String,
    pub meta: Value,
}

impl ReceiptDraft {
    /// A draft with empty routing detail, for local (non-gateway) receipts.
    pub fn local(policy: &str, route: &str) -> Self {
        Self {
            policy: policy.to_string(),
            route_primary: route.to_string(),
            route_final: route.to_string(),
            fallback_count: 0,
            reasons: Vec::new(),
            latency_ms: 0,
            first_token_ms: None,
            task_id: None,
            parent_id: None,
            agent: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            prompt_hash: String::new(),
            policy_hash: String::new(),
            meta: Value::Object(Default::default()),
        }
    }
}

/// A persisted receipt, as written.
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: String,
    pub ts: String,
    pub policy: String,
    pub route_primary: String,
    pub route_final: String,
    pub fallback_count: u32,
    pub reasons: Vec<String>,
    pub latency_ms: u64,
    pub first_token_ms: Option<u64>,
    pub task_id: Option<String>,
    pub parent_id: Option<String>,
    pub agent: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub prompt_hash: String,
    pub policy_hash: String,
    pub meta: Value,
    pub payload_json: String,
    pub signature: String,
}

/// Canonical signing payload. Field declaration order fixes the JSON field
/// order (`serde_json` is built with `preserve_order`).
#[derive(Serialize)]
struct ReceiptPayload<'a> {
    id: &'a str,
    ts: &'a str,
    policy: &'a str,
    route_primary: &'a str,
    route_final: &'a str,
    fallback_count: u32,
    reasons: &'a [String],
    latency_ms: u64,
    first_token_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
    prompt_tokens: u32,
    completion_tokens: u32,
    cost_usd: f64,
    prompt_hash: &'a str,
    policy_hash: &'a str,
    meta: &'a Value,
}

// ---------------------------------------------------------------------------
// Timeline rows
// ---------------------------------------------------------------------------

/// One row of a task timeline, ascending by ts.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineRow {
    pub id: String,
    pub ts: String,
    pub agent: Option<String>,
    pub route_final: String,
    pub latency_ms: u64,
    pub cost_usd: f64,
    /// Present only in the raw variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// A routing sample for the p95 window.
#[derive(Debug, Clone)]
pub struct TraceSample {
    pub user_ref: Option<String>,
    pub policy: String,
    pub route_primary: String,
    pub route_final: String,
    pub latency_ms: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Builds, signs, optionally redacts, and persists receipts; owns trace
/// insertion and the p95 query.
pub struct ReceiptRecorder {
    ledger: Ledger,
    secret: String,
    redact: bool,
    redact_fields: Vec<String>,
    mirror_dir: Option<PathBuf>,
}

impl ReceiptRecorder {
    pub fn new(ledger: Ledger, config: &RuntimeConfig) -> Self {
        Self {
            ledger,
            secret: config.secret.clone(),
            redact: config.redact,
            redact_fields: config.redact_fields.clone(),
            mirror_dir: config.mirror_json.then(|| config.mirror_dir.clone()),
        }
    }

    /// Build, sign, and persist a receipt. The mirror file (when enabled) is
    /// flushed before the receipt is returned.
    pub fn record(&self, mut draft: ReceiptDraft) -> Result<Receipt, PilotError> {
        if self.redact {
            self.redact_draft(&mut draft);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let payload = ReceiptPayload {
            id: &id,
            ts: &ts,
            policy: &draft.policy,
            route_primary: &draft.route_primary,
            route_final: &draft.route_final,
            fallback_count: draft.fallback_count,
            reasons: &draft.reasons,
            latency_ms: draft.latency_ms,
            first_token_ms: draft.first_token_ms,
            task_id: draft.task_id.as_deref(),
            parent_id: draft.parent_id.as_deref(),
            agent: draft.agent.as_deref(),
            prompt_tokens: draft.prompt_tokens,
            completion_tokens: draft.completion_tokens,
            cost_usd: draft.cost_usd,
            prompt_hash: &draft.prompt_hash,
            policy_hash: &draft.policy_hash,
            meta: &draft.meta,
        };
        let payload_json = serde_json::to_string(&payload)?;
        let signature = sign_payload(&self.secret, &payload_json);

        self.ledger.with_conn(|conn| {
            conn.execute(
                "INSERT INTO receipts (id, ts, policy, route_primary, route_final, \
                 fallback_count, reasons, latency_ms, first_token_ms, task_id, parent_id, \
                 agent, prompt_tokens, completion_tokens, cost_usd, prompt_hash, policy_hash, \
                 meta, payload_json, signature) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20)",
                params![
                    id,
                    ts,
                    draft.policy,
                    draft.route_primary,
                    draft.route_final,
                    draft.fallback_count,
                    serde_json::to_string(&draft.reasons).unwrap_or_else(|_| "[]".into()),
                    draft.latency_ms,
                    draft.first_token_ms,
                    draft.task_id,
                    draft.parent_id,
                    draft.agent,
                    draft.prompt_tokens,
                    draft.completion_tokens,
                    draft.cost_usd,
                    draft.prompt_hash,
                    draft.policy_hash,
                    draft.meta.to_string(),
                    payload_json,
                    signature,
                ],
            )?;
            Ok(())
        })?;

        if let Some(ref dir) = self.mirror_dir {
            self.write_mirror(dir, &id, &ts, &payload_json, &signature)?;
        }

        Ok(Receipt {
            id,
            ts,
            policy: draft.policy,
            route_primary: draft.route_primary,
            route_final: draft.route_final,
            fallback_count: draft.fallback_count,
            reasons: draft.reasons,
            latency_ms: draft.latency_ms,
            first_token_ms: draft.first_token_ms,
            task_id: draft.task_id,
            parent_id: draft.parent_id,
            agent: draft.agent,
            prompt_tokens: draft.prompt_tokens,
            completion_tokens: draft.completion_tokens,
            cost_usd: draft.cost_usd,
            prompt_hash: draft.prompt_hash,
            policy_hash: draft.policy_hash,
            meta: draft.meta,
            payload_json,
            signature,
        })
    }

    /// Scrub the draft in place so the payload, the stored columns, and the
    /// mirror all agree. Signatures cover the post-redaction payload.
    fn redact_draft(&self, draft: &mut ReceiptDraft) {
        draft.policy = redact_text(&draft.policy);
        if let Some(agent) = draft.agent.take() {
            draft.agent = Some(redact_text(&agent));
        }
        redact_value(&mut draft.meta, &self.redact_fields);
    }

    fn write_mirror(
        &self,
        dir: &PathBuf,
        id: &str,
        ts: &str,
        payload_json: &str,
        signature: &str,
    ) -> Result<(), PilotError> {
        let day = &ts[..10];
        let subdir = dir.join(day);
        std::fs::create_dir_all(&subdir)
            .map_err(|e| PilotError::Unknown(format!("mirror dir: {e}")))?;

        let doc = serde_json::json!({
            "payload": serde_json::from_str::<Value>(payload_json)?,
            "signature": signature,
        });
        let path = subdir.join(format!("{id}.json"));
        let mut file = std::fs::File::create(&path)
            .map_err(|e| PilotError::Unknown(format!("mirror file: {e}")))?;
        serde_json::to_writer_pretty(&mut file, &doc)?;
        file.flush()
            .map_err(|e| PilotError::Unknown(format!("mirror flush: {e}")))?;
        Ok(())
    }

    /// Mirror an arbitrary document (e.g. a prepared message list) next to
    /// the receipts, under the same day directory.
    pub fn mirror_document(&self, name: &str, doc: &Value) -> Result<(), PilotError> {
        let Some(ref dir) = self.mirror_dir else {
            return Ok(());
        };
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let subdir = dir.join(day);
        std::fs::create_dir_all(&subdir)
            .map_err(|e| PilotError::Unknown(format!("mirror dir: {e}")))?;
        let mut file = std::fs::File::create(subdir.join(name))
            .map_err(|e| PilotError::Unknown(format!("mirror file: {e}")))?;
        serde_json::to_writer_pretty(&mut file, doc)?;
        file.flush()
            .map_err(|e| PilotError::Unknown(format!("mirror flush: {e}")))?;
        Ok(())
    }

    /// Load a receipt by id.
    pub fn load(&self, id: &str) -> Result<Option<Receipt>, PilotError> {
        let row = self.ledger.with_conn(|conn| {
            conn.query_row(
                "SELECT id, ts, policy, route_primary, route_final, fallback_count, reasons, \
                 latency_ms, first_token_ms, task_id, parent_id, agent, prompt_tokens, \
                 completion_tokens, cost_usd, prompt_hash, policy_hash, meta, payload_json, \
                 signature FROM receipts WHERE id = ?1",
                params![id],
                row_to_receipt,
            )
            .optional()
        })?;
        Ok(row)
    }

    /// Most recent receipt for a task, if any.
    pub fn latest_for_task(&self, task_id: &str) -> Result<Option<Receipt>, PilotError> {
        let row = self.ledger.with_conn(|conn| {
            conn.query_row(
                "SELECT id, ts, policy, route_primary, route_final, fallback_count, reasons, \
                 latency_ms, first_token_ms, task_id, parent_id, agent, prompt_tokens, \
                 completion_tokens, cost_usd, prompt_hash, policy_hash, meta, payload_json, \
                 signature FROM receipts WHERE task_id = ?1 ORDER BY ts DESC, id DESC LIMIT 1",
                params![task_id],
                row_to_receipt,
            )
            .optional()
        })?;
        Ok(row)
    }

    /// Verify a stored receipt's signature under this recorder's secret.
    pub fn verify(&self, receipt: &Receipt) -> bool {
        verify_signature(&self.secret, &receipt.payload_json, &receipt.signature)
    }

    // -- timelines -----------------------------------------------------------

    /// Rows for a task in ascending ts order, without parent ids.
    pub fn timeline_for_task(&self, task_id: &str) -> Result<Vec<TimelineRow>, PilotError> {
        self.timeline_query(task_id, false)
    }

    /// Rows for a task including parent ids, for tree reconstruction.
    pub fn timeline_rows_raw(&self, task_id: &str) -> Result<Vec<TimelineRow>, PilotError> {
        self.timeline_query(task_id, true)
    }

    /// Group raw rows by parent: children under their `parent_id`, roots
    /// under a synthetic `ROOT:<task_id>` key.
    pub fn timeline_tree(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<String, Vec<TimelineRow>>, PilotError> {
        let rows = self.timeline_rows_raw(task_id)?;
        let mut groups: BTreeMap<String, Vec<TimelineRow>> = BTreeMap::new();
        for row in rows {
            let key = row
                .parent_id
                .clone()
                .unwrap_or_else(|| format!("ROOT:{task_id}"));
            groups.entry(key).or_default().push(row);
        }
        Ok(groups)
    }

    fn timeline_query(
        &self,
        task_id: &str,
        with_parent: bool,
    ) -> Result<Vec<TimelineRow>, PilotError> {
        let rows = self.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts, agent, route_final, latency_ms, cost_usd, parent_id \
                 FROM receipts WHERE task_id = ?1 ORDER BY ts ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![task_id], |row| {
                    Ok(TimelineRow {
                        id: row.get(0)?,
                        ts: row.get(1)?,
                        agent: row.get(2)?,
                        route_final: row.get(3)?,
                        latency_ms: row.get(4)?,
                        cost_usd: row.get(5)?,
                        parent_id: if with_parent { row.get(6)? } else { None },
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    // -- traces --------------------------------------------------------------

    /// Insert one routing sample.
    pub fn record_trace(&self, sample: &TraceSample) -> Result<(), PilotError> {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.ledger.with_conn(|conn| {
            conn.execute(
                "INSERT INTO traces (ts, user_ref, policy, route_primary, route_final, \
                 latency_ms, tokens, cost_usd) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ts,
                    sample.user_ref,
                    sample.policy,
                    sample.route_primary,
                    sample.route_final,
                    sample.latency_ms,
                    sample.tokens,
                    sample.cost_usd,
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// p95 latency over the most recent `window` samples for `model`.
    ///
    /// Returns `None` iff no trace exists. Otherwise this is
    /// `sorted_asc[floor(0.95 * (k - 1))]` where `k` is the number of rows
    /// available within the window.
    pub fn p95_latency_for(&self, model: &str, window: usize) -> Result<Option<u64>, PilotError> {
        let mut latencies = self.recent_latencies(model, window)?;
        if latencies.is_empty() {
            return Ok(None);
        }
        latencies.sort_unstable();
        let idx = (0.95 * (latencies.len() - 1) as f64).floor() as usize;
        Ok(Some(latencies[idx]))
    }

    /// Number of samples available for `model` within the window.
    pub fn sample_count_for(&self, model: &str, window: usize) -> Result<usize, PilotError> {
        Ok(self.recent_latencies(model, window)?.len())
    }

    fn recent_latencies(&self, model: &str, window: usize) -> Result<Vec<u64>, PilotError> {
        let rows = self.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT latency_ms FROM traces WHERE route_final = ?1 \
                 ORDER BY ts DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![model, window as i64], |row| row.get::<_, u64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }
}

fn row_to_receipt(row: &rusqlite::Row<'_>) -> Result<Receipt, rusqlite::Error> {
    let reasons_json: String = row.get(6)?;
    let meta_json: String = row.get(17)?;
    Ok(Receipt {
        id: row.get(0)?,
        ts: row.get(1)?,
        policy: row.get(2)?,
        route_primary: row.get(3)?,
        route_final: row.get(4)?,
        fallback_count: row.get(5)?,
        reasons: serde_json::from_str(&reasons_json).unwrap_or_default(),
        latency_ms: row.get(7)?,
        first_token_ms: row.get(8)?,
        task_id: row.get(9)?,
        parent_id: row.get(10)?,
        agent: row.get(11)?,
        prompt_tokens: row.get(12)?,
        completion_tokens: row.get(13)?,
        cost_usd: row.get(14)?,
        prompt_hash: row.get(15)?,
        policy_hash: row.get(16)?,
        meta: serde_json::from_str(&meta_json).unwrap_or(Value::Null),
        payload_json: row.get(18)?,
        signature: row.get(19)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Chain compositions.
//!
//! The helpdesk chain runs Triage, a conditional Retriever, and a Writer in
//! sequence; the parallel variant fans Triage's output over two retrievers,
//! reduces with a deterministic aggregator, and hands the merged records to
//! the Writer. Receipt lineage threads through `parent_id` so timelines
//! render in causal order.

use std::collections::BTreeMap;
use std::time::Instant;

use futures::future::select_all;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::agents::controller::{AgentController, HopOutcome};
use crate::agents::{AgentRegistry, AgentSpec, HopBudget, TaskEnvelope};
use crate::error::PilotError;
use crate::receipts::{sha256_hex, ReceiptDraft};

/// Route label for receipts of local (non-gateway) aggregation steps.
const AGGREGATOR_ROUTE: &str = "aggregator";

/// What a chain produced.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub task_id: String,
    pub final_output: Value,
    /// Receipt ids in causal order (absent entries mean dry run).
    pub receipts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Sequential helpdesk
// ---------------------------------------------------------------------------

/// Triage, then Retriever when triage names fields (skipped when triage ran
/// over budget), then Writer. The Writer's parent is whichever hop fed it.
pub async fn run_helpdesk(
    ctrl: &AgentController<'_>,
    task_id: &str,
    input: Value,
    budget: HopBudget,
) -> Result<ChainReport, PilotError> {
    let mut receipts = Vec::new();

    let triage_policy = ctrl.ctx().agents.get("Triage")?.policy.clone();
    let triage_env = TaskEnvelope::new(task_id, "Triage", &triage_policy, budget, input.clone());
    let triage = ctrl.run_hop(&triage_env).await?;
    push_receipt(&mut receipts, &triage);

    let fields = triage.output.get("fields").cloned().unwrap_or(json!([]));
    let wants_retrieval = fields.as_array().map_or(false, |f| !f.is_empty());

    let (records, writer_parent) = if triage.over_budget {
        // Budget already blown upstream: degrade to an empty record set.
        debug!(task_id, "Triage over budget, skipping retrieval");
        (json!({ "records": [] }), triage.receipt_id())
    } else if wants_retrieval {
        let retriever_policy = ctrl.ctx().agents.get("Retriever")?.policy.clone();
        let retriever_env = TaskEnvelope::new(
            task_id,
            "Retriever",
            &retriever_policy,
            budget,
            json!({ "fields": fields, "source": input }),
        )
        .with_parent(triage.receipt_id());
        let retriever = ctrl.run_hop(&retriever_env).await?;
        push_receipt(&mut receipts, &retriever);
        let parent = retriever.receipt_id();
        (retriever.output, parent)
    } else {
        (json!({ "records": [] }), triage.receipt_id())
    };

    let writer_policy = ctrl.ctx().agents.get("Writer")?.policy.clone();
    let writer_env = TaskEnvelope::new(
        task_id,
        "Writer",
        &writer_policy,
        budget,
        json!({ "request": input, "triage": triage.output, "records": records }),
    )
    .with_parent(writer_parent);
    let writer = ctrl.run_hop(&writer_env).await?;
    push_receipt(&mut receipts, &writer);

    Ok(ChainReport {
        task_id: task_id.to_string(),
        final_output: writer.output,
        receipts,
    })
}

// ---------------------------------------------------------------------------
// Parallel helpdesk
// ---------------------------------------------------------------------------

/// Triage, fan-out over the fast and accurate retrievers, aggregator
/// reduce, Writer. All downstream hops parent on the Triage receipt.
pub async fn run_helpdesk_par(
    ctrl: &AgentController<'_>,
    task_id: &str,
    input: Value,
    budget: HopBudget,
    early_stop: bool,
) -> Result<ChainReport, PilotError> {
    let mut receipts = Vec::new();

    let triage_policy = ctrl.ctx().agents.get("Triage")?.policy.clone();
    let triage_env = TaskEnvelope::new(task_id, "Triage", &triage_policy, budget, input.clone());
    let triage = ctrl.run_hop(&triage_env).await?;
    push_receipt(&mut receipts, &triage);

    let fields = triage.output.get("fields").cloned().unwrap_or(json!([]));
    let branch_input = json!({ "fields": fields, "source": input });
    let branch_names = ["RetrieverFast", "RetrieverAccurate"];

    let mut branch_envs = Vec::new();
    for name in branch_names {
        let policy = ctrl.ctx().agents.get(name)?.policy.clone();
        branch_envs.push(
            TaskEnvelope::new(task_id, name, &policy, budget, branch_input.clone())
                .with_parent(triage.receipt_id()),
        );
    }

    let (branch_outputs, cancelled_agents) = if early_stop {
        fan_out_early_stop(ctrl, branch_envs, &mut receipts).await?
    } else {
        fan_out_join_all(ctrl, branch_envs, &mut receipts).await?
    };

    // Deterministic reduce; the model gets no say on record identity.
    let reduce_started = Instant::now();
    let reduced = aggregate_records(&branch_outputs);
    let aggregator =
        record_aggregator_receipt(ctrl, task_id, &triage, &reduced, cancelled_agents, reduce_started)?;
    if let Some(id) = aggregator {
        receipts.push(id);
    }

    let writer_policy = ctrl.ctx().agents.get("Writer")?.policy.clone();
    let writer_env = TaskEnvelope::new(
        task_id,
        "Writer",
        &writer_policy,
        budget,
        json!({ "request": input, "triage": triage.output, "records": reduced }),
    )
    .with_parent(triage.receipt_id());
    let writer = ctrl.run_hop(&writer_env).await?;
    push_receipt(&mut receipts, &writer);

    Ok(ChainReport {
        task_id: task_id.to_string(),
        final_output: writer.output,
        receipts,
    })
}

/// Await every branch; any failure fails the chain.
async fn fan_out_join_all(
    ctrl: &AgentController<'_>,
    envs: Vec<TaskEnvelope>,
    receipts: &mut Vec<String>,
) -> Result<(Vec<Value>, Vec<String>), PilotError> {
    let branch_futures: Vec<_> = envs.iter().map(|env| ctrl.run_hop(env)).collect();
    let results = futures::future::join_all(branch_futures).await;

    let mut outputs = Vec::new();
    for result in results {
        let hop = result?;
        push_receipt(receipts, &hop);
        outputs.push(hop.output);
    }
    Ok((outputs, Vec::new()))
}

/// Start every branch; the first success wins and the rest are dropped
/// mid-flight. Dropped branches contribute no receipt; their names are
/// reported so the aggregator can record them.
async fn fan_out_early_stop(
    ctrl: &AgentController<'_>,
    envs: Vec<TaskEnvelope>,
    receipts: &mut Vec<String>,
) -> Result<(Vec<Value>, Vec<String>), PilotError> {
    let all_names: Vec<String> = envs.iter().map(|e| e.agent.clone()).collect();
    let mut remaining: Vec<_> = envs
        .iter()
        .map(|env| {
            Box::pin(async move { (env.agent.clone(), ctrl.run_hop(env).await) })
        })
        .collect();

    let mut completed: Vec<String> = Vec::new();
    let mut errors: Vec<PilotError> = Vec::new();
    while !remaining.is_empty() {
        let ((agent, result), _index, rest) = select_all(remaining).await;
        remaining = rest;
        completed.push(agent.clone());

        match result {
            Ok(hop) => {
                let cancelled: Vec<String> = all_names
                    .iter()
                    .filter(|name| !completed.contains(*name))
                    .cloned()
                    .collect();
                // Dropping the unfinished futures aborts their requests;
                // aborted branches never reach their receipt write.
                drop(remaining);
                info!(winner = %agent, cancelled = ?cancelled, "Early-stop fan-out settled");
                push_receipt(receipts, &hop);
                return Ok((vec![hop.output], cancelled));
            }
            Err(e) => errors.push(e),
        }
    }

    Err(errors
        .pop()
        .unwrap_or_else(|| PilotError::Unknown("fan-out produced no branches".into())))
}

fn record_aggregator_receipt(
    ctrl: &AgentController<'_>,
    task_id: &str,
    triage: &HopOutcome,
    reduced: &Value,
    cancelled_agents: Vec<String>,
    started: Instant,
) -> Result<Option<String>, PilotError> {
    if ctrl.ctx().config.dry_run {
        return Ok(None);
    }

    let policy_name = ctrl.ctx().agents.get("Aggregator")?.policy.clone();
    let policy = ctrl.ctx().policies.get(&policy_name)?;

    let mut meta = Map::new();
    if !cancelled_agents.is_empty() {
        meta.insert(
            "cancelled_agents".into(),
            Value::Array(cancelled_agents.into_iter().map(Value::String).collect()),
        );
    }

    let receipt = ctrl.ctx().recorder.record(ReceiptDraft {
        policy: policy_name,
        route_primary: AGGREGATOR_ROUTE.into(),
        route_final: AGGREGATOR_ROUTE.into(),
        fallback_count: 0,
        reasons: Vec::new(),
        latency_ms: started.elapsed().as_millis() as u64,
        first_token_ms: None,
        task_id: Some(task_id.to_string()),
        parent_id: triage.receipt_id(),
        agent: Some("Aggregator".into()),
        prompt_tokens: 0,
        completion_tokens: 0,
        cost_usd: 0.0,
        prompt_hash: sha256_hex(&reduced.to_string()),
        policy_hash: policy.canonical_hash(),
        meta: Value::Object(meta),
    })?;
    Ok(Some(receipt.id))
}

fn push_receipt(receipts: &mut Vec<String>, hop: &HopOutcome) {
    if let Some(id) = hop.receipt_id() {
        receipts.push(id);
    }
}

// ---------------------------------------------------------------------------
// Aggregator reduce
// ---------------------------------------------------------------------------

/// Union branch `records[]`, dedupe by `id` (the most populated record
/// survives and absorbs missing fields from the others), and sort by id
/// ascending, falling back to JSON-string order for id-less records. Pure
/// and idempotent: `reduce(reduce(x)) == reduce(x)`.
pub fn aggregate_records(outputs: &[Value]) -> Value {
    let mut by_id: BTreeMap<String, Value> = BTreeMap::new();
    let mut anonymous: Vec<Value> = Vec::new();

    for output in outputs {
        let Some(records) = output.get("records").and_then(Value::as_array) else {
            continue;
        };
        for record in records {
            match record_id(record) {
                Some(id) => match by_id.remove(&id) {
                    Some(existing) => {
                        by_id.insert(id, merge_records(existing, record.clone()));
                    }
                    None => {
                        by_id.insert(id, record.clone());
                    }
                },
                None => anonymous.push(record.clone()),
            }
        }
    }

    let mut records: Vec<Value> = by_id.into_values().chain(anonymous).collect();
    records.sort_by_key(sort_key);

    json!({ "records": records })
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn sort_key(record: &Value) -> String {
    record_id(record).unwrap_or_else(|| record.to_string())
}

fn populated_count(record: &Value) -> usize {
    record
        .as_object()
        .map(|map| map.values().filter(|v| !v.is_null()).count())
        .unwrap_or(0)
}

/// Keep the record with the most populated fields; shallow-merge the
/// other's fields into the gaps. Ties keep the first-seen record.
fn merge_records(existing: Value, incoming: Value) -> Value {
    let (mut survivor, donor) = if populated_count(&incoming) > populated_count(&existing) {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    if let (Some(target), Some(source)) = (survivor.as_object_mut(), donor.as_object()) {
        for (key, value) in source {
            let missing = target.get(key).map_or(true, Value::is_null);
            if missing && !value.is_null() {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    survivor
}

// ---------------------------------------------------------------------------
// Demo agent set
// ---------------------------------------------------------------------------

/// Register the helpdesk agent family against one policy. The CLI and the
/// tests use this when no agent definitions were supplied.
pub fn register_helpdesk_agents(registry: &mut AgentRegistry, policy: &str) {
    let object_schema = |required: &[&str], props: &[(&str, &str)]| -> crate::agents::SchemaSpec {
        serde_json::from_value(json!({
            "type": "object",
            "properties": props
                .iter()
                .map(|(name, kind)| (name.to_string(), json!({ "type": kind })))
                .collect::<Map<String, Value>>(),
            "required": required,
        }))
        .expect("static schema")
    };

    registry.insert(AgentSpec {
        name: "Triage".into(),
        policy: policy.into(),
        system: Some(
            "Classify the request. Reply with strict JSON: \
             {\"intent\": string, \"fields\": string[]}."
                .into(),
        ),
        tools: vec!["http_fetch".into()],
        input_schema: Some(object_schema(&[], &[("text", "string"), ("ids", "array")])),
        output_schema: Some(object_schema(&["intent"], &[("intent", "string"), ("fields", "array")])),
    });

    for name in ["Retriever", "RetrieverFast", "RetrieverAccurate"] {
        registry.insert(AgentSpec {
            name: name.into(),
            policy: policy.into(),
            system: Some(
                "Look up the requested records. Reply with strict JSON: \
                 {\"records\": object[]}."
                    .into(),
            ),
            tools: vec![],
            input_schema: Some(object_schema(&["fields"], &[("fields", "array")])),
            output_schema: Some(object_schema(&["records"], &[("records", "array")])),
        });
    }

    registry.insert(AgentSpec {
        name: "Aggregator".into(),
        policy: policy.into(),
        system: None,
        tools: vec![],
        input_schema: None,
        output_schema: Some(object_schema(&["records"], &[("records", "array")])),
    });

    registry.insert(AgentSpec {
        name: "Writer".into(),
        policy: policy.into(),
        system: Some(
            "Draft the reply to the user. Reply with strict JSON: {\"draft\": string}.".into(),
        ),
        tools: vec![],
        input_schema: None,
        output_schema: Some(object_schema(&["draft"], &[("draft", "string")])),
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

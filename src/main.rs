//! RoutePilot -- policy-driven CLI orchestrator for LLM gateways.
//!
//! The entry point wires configuration, the ledger, and the registries,
//! then dispatches one of the subcommands:
//!   - infer     one supervised completion, streamed to stdout
//!   - chat      multi-turn session with persisted history
//!   - task      a sub-agent chain (helpdesk or helpdesk-par)
//!   - usage     per-user token totals
//!   - timeline  the receipt tree of a task

use std::collections::HashMap;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use routepilot::agents::chains::{self, ChainReport};
use routepilot::agents::controller::AgentController;
use routepilot::agents::HopBudget;
use routepilot::config::RuntimeConfig;
use routepilot::db::Ledger;
use routepilot::error::PilotError;
use routepilot::gateway::sse::StdoutSink;
use routepilot::infer::{InferRequest, InferenceDriver};
use routepilot::policy::Policy;
use routepilot::session::SessionDriver;
use routepilot::PilotCtx;

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CliArgs {
    command: String,
    flags: HashMap<String, String>,
}

impl CliArgs {
    fn get(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    fn require(&self, name: &str) -> Result<&str, PilotError> {
        self.get(name)
            .ok_or_else(|| PilotError::Config(format!("--{name} is required")))
    }
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs::default();

    match args.next().as_deref() {
        Some("--help") | Some("-h") | None => {
            print_usage();
            std::process::exit(0);
        }
        Some("--version") | Some("-V") => {
            println!("routepilot {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some(command) => parsed.command = command.to_string(),
    }

    while let Some(arg) = args.next() {
        if let Some(name) = arg.strip_prefix("--") {
            // Bare flags ("--receipts") get the value "1".
            let value = args.next().unwrap_or_else(|| "1".to_string());
            parsed.flags.insert(name.to_string(), value);
        } else {
            eprintln!("Unknown argument: {arg}");
            eprintln!("Run with --help for usage information.");
            std::process::exit(64);
        }
    }

    parsed
}

fn print_usage() {
    println!(
        "\
routepilot {version} -- policy-driven LLM gateway orchestrator

USAGE:
    routepilot <COMMAND> [FLAGS]

COMMANDS:
    infer     --policy <name> --user <ref> --prompt <text>
              [--policy-file <json>] [--attachment-file <path>]
              [--shadow <model>] [--db <path>]
    chat      --user <ref> --agent <name> --policy <name> --input <text>
              [--session <id>] [--receipts] [--db <path>]
    task      --chain <helpdesk|helpdesk-par> --policy <name> --input <json>
              [--task-id <id>] [--budget-tokens N] [--budget-cost-usd X]
              [--budget-time-ms N] [--db <path>]
    usage     --user <ref> [--tz <iana>] [--db <path>]
    timeline  --task <id> [--db <path>]

ENVIRONMENT:
    AI_GATEWAY_BASE_URL, AI_GATEWAY_API_KEY   gateway endpoint (required)
    JWT_SECRET                                receipt signing key
    RUST_LOG                                  log filter (e.g. routepilot=debug)
    ROUTEPILOT_* / CHAOS_* / HTTP_FETCH_*     ambient flags, see docs
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("routepilot=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    if let Err(err) = run(args).await {
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(args: CliArgs) -> Result<(), PilotError> {
    let config = RuntimeConfig::from_env()?;

    let db_path = PathBuf::from(args.get("db").unwrap_or("routepilot.db"));
    let ledger =
        Ledger::open(&db_path).map_err(|e| PilotError::Database(e.to_string()))?;

    let mut ctx = PilotCtx::new(config, ledger);
    load_policies(&mut ctx, &args)?;

    match args.command.as_str() {
        "infer" => cmd_infer(&ctx, &args).await,
        "chat" => cmd_chat(&ctx, &args).await,
        "task" => cmd_task(&mut ctx, &args).await,
        "usage" => cmd_usage(&ctx, &args),
        "timeline" => cmd_timeline(&ctx, &args),
        other => Err(PilotError::Config(format!("unknown command: {other}"))),
    }
}

/// Register policies from `--policy-file` (a JSON map of name -> policy
/// document). YAML conversion happens outside this binary.
fn load_policies(ctx: &mut PilotCtx, args: &CliArgs) -> Result<(), PilotError> {
    let Some(path) = args.get("policy-file") else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PilotError::Policy {
            name: path.to_string(),
            issues: vec![routepilot::error::PolicyIssue {
                path: String::new(),
                message: format!("cannot read file: {e}"),
            }],
        })?;
    let documents: HashMap<String, serde_json::Value> =
        serde_json::from_str(&raw).map_err(|e| PilotError::Policy {
            name: path.to_string(),
            issues: vec![routepilot::error::PolicyIssue {
                path: String::new(),
                message: format!("invalid JSON: {e}"),
            }],
        })?;

    for (name, document) in documents {
        let policy = Policy::from_value(&name, document)?;
        ctx.policies.insert(&name, policy)?;
    }
    Ok(())
}

async fn cmd_infer(ctx: &PilotCtx, args: &CliArgs) -> Result<(), PilotError> {
    let attachment = match args.get("attachment-file") {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
            PilotError::Config(format!("cannot read attachment {path}: {e}"))
        })?),
        None => None,
    };

    let request = InferRequest {
        user: args.require("user")?,
        policy: args.require("policy")?,
        prompt: args.require("prompt")?,
        attachment: attachment.as_deref(),
        shadow: args.get("shadow"),
    };

    let mut sink = StdoutSink;
    let report = InferenceDriver::new(ctx).infer(&request, &mut sink).await?;
    println!();
    tracing::info!(
        receipt = %report.receipt.id,
        route = %report.outcome.route_final,
        fallbacks = report.outcome.fallback_count,
        latency_ms = report.outcome.latency_ms,
        cost_usd = report.cost_usd,
        "Inference complete"
    );
    Ok(())
}

async fn cmd_chat(ctx: &PilotCtx, args: &CliArgs) -> Result<(), PilotError> {
    let driver = SessionDriver::new(ctx);

    let session_id = match args.get("session") {
        Some(id) => id.to_string(),
        None => {
            let id = driver.open(
                args.require("user")?,
                args.require("agent")?,
                args.require("policy")?,
            )?;
            eprintln!("session: {id}");
            id
        }
    };

    let mut sink = StdoutSink;
    let report = driver
        .turn(
            &session_id,
            args.require("input")?,
            None,
            args.get("receipts").is_some(),
            &mut sink,
        )
        .await?;
    println!();
    tracing::info!(
        session = %report.session_id,
        route = %report.route_final,
        receipt = ?report.receipt_id,
        "Turn complete"
    );
    Ok(())
}

async fn cmd_task(ctx: &mut PilotCtx, args: &CliArgs) -> Result<(), PilotError> {
    let policy = args.require("policy")?.to_string();
    ctx.policies.get(&policy)?;
    chains::register_helpdesk_agents(&mut ctx.agents, &policy);

    let input: serde_json::Value = serde_json::from_str(args.require("input")?)
        .map_err(|e| PilotError::Config(format!("--input must be JSON: {e}")))?;
    let task_id = args
        .get("task-id")
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let budget = HopBudget {
        tokens: parse_flag(args, "budget-tokens", 4_000)?,
        cost_usd: parse_flag(args, "budget-cost-usd", 0.05)?,
        time_ms: parse_flag(args, "budget-time-ms", 8_000)?,
    };

    let early_stop = ctx.config.early_stop;
    let controller = AgentController::new(ctx);
    let report: ChainReport = match args.require("chain")? {
        "helpdesk" => chains::run_helpdesk(&controller, &task_id, input, budget).await?,
        "helpdesk-par" => {
            chains::run_helpdesk_par(&controller, &task_id, input, budget, early_stop).await?
        }
        other => {
            return Err(PilotError::Config(format!("unknown chain: {other}")));
        }
    };

    println!("{}", serde_json::to_string_pretty(&report.final_output)?);
    tracing::info!(
        task = %report.task_id,
        receipts = report.receipts.len(),
        "Chain complete"
    );
    Ok(())
}

fn cmd_usage(ctx: &PilotCtx, args: &CliArgs) -> Result<(), PilotError> {
    let tz = args.get("tz").unwrap_or(&ctx.config.default_tz);
    let summary = ctx.quota.usage_summary(args.require("user")?, tz)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_timeline(ctx: &PilotCtx, args: &CliArgs) -> Result<(), PilotError> {
    let task_id = args.require("task")?;
    let tree = ctx.recorder.timeline_tree(task_id)?;
    if tree.is_empty() {
        println!("no receipts for task {task_id}");
        return Ok(());
    }
    for (parent, rows) in &tree {
        println!("{parent}");
        for row in rows {
            println!(
                "  {} {} agent={} route={} latency={}ms cost=${:.4}",
                row.ts,
                row.id,
                row.agent.as_deref().unwrap_or("-"),
                row.route_final,
                row.latency_ms,
                row.cost_usd,
            );
        }
    }
    Ok(())
}

fn parse_flag<T: std::str::FromStr>(
    args: &CliArgs,
    name: &str,
    default: T,
) -> Result<T, PilotError> {
    match args.get(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| PilotError::Config(format!("--{name} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

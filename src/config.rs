//! Runtime configuration.
//!
//! All ambient settings come from the process environment and are read once
//! at startup into a [`RuntimeConfig`] that is passed explicitly through the
//! call graph. Boolean flags use the literal value "1".

use std::path::PathBuf;
use std::time::Duration;

use crate::error::PilotError;

/// Default HMAC key identifier when JWT_SECRET is unset.
pub const DEFAULT_SECRET: &str = "dev-secret";

/// Default number of ids http_fetch will resolve per hop.
pub const DEFAULT_HTTP_FETCH_MAX: usize = 3;

/// Default per-fetch timeout.
pub const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(8);

/// Default response size cap for http_fetch.
pub const HTTP_FETCH_MAX_BODY: usize = 1024 * 1024;

/// Settings for the http_fetch tool pre-fetch.
#[derive(Debug, Clone, Default)]
pub struct HttpFetchSettings {
    /// Allowed hosts, exact names or `*.suffix` wildcards.
    pub allowlist: Vec<String>,
    /// URL template containing the literal `{id}` placeholder.
    pub url_template: Option<String>,
    /// Maximum number of ids fetched per hop.
    pub max: usize,
}

/// Fault-injection switches for failover demos.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaosFlags {
    /// Sleep past the stall cutoff when the primary model is attempted.
    pub primary_stall: bool,
    /// Raise a synthetic 503 when the primary model is attempted.
    pub http_5xx: bool,
}

/// Process-wide configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub api_key: String,
    /// HMAC-SHA-256 key for receipt signatures.
    pub secret: String,

    /// Mirror pretty-printed receipts to a file tree.
    pub mirror_json: bool,
    /// Directory root for the receipt mirror and input snapshots.
    pub mirror_dir: PathBuf,
    /// Snapshot prepared message lists next to the mirror.
    pub snapshot_input: bool,

    pub redact: bool,
    /// Meta keys scrubbed outright when redaction is on.
    pub redact_fields: Vec<String>,

    /// Issue a non-stream probe when the gateway omits usage headers.
    pub usage_probe: bool,
    /// Cancel losing branches in parallel fan-out.
    pub early_stop: bool,
    /// Skip network calls in the sub-agent controller.
    pub dry_run: bool,

    pub http_fetch: HttpFetchSettings,
    pub chaos: ChaosFlags,

    /// Fallback timezone when a policy does not name one.
    pub default_tz: String,
}

impl RuntimeConfig {
    /// Read configuration from the environment.
    ///
    /// `AI_GATEWAY_BASE_URL` and `AI_GATEWAY_API_KEY` are required; everything
    /// else has a default.
    pub fn from_env() -> Result<Self, PilotError> {
        let base_url = require_env("AI_GATEWAY_BASE_URL")?;
        let api_key = require_env("AI_GATEWAY_API_KEY")?;

        let secret =
            std::env::var("JWT_SECRET").unwrap_or_else(|_| DEFAULT_SECRET.to_string());

        let max = match std::env::var("HTTP_FETCH_MAX") {
            Ok(raw) => raw.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                PilotError::Config(format!("HTTP_FETCH_MAX must be a positive integer, got {raw:?}"))
            })?,
            Err(_) => DEFAULT_HTTP_FETCH_MAX,
        };

        let url_template = std::env::var("HTTP_FETCH_URL_TEMPLATE").ok();
        if let Some(ref tpl) = url_template {
            if !tpl.contains("{id}") {
                return Err(PilotError::Config(
                    "HTTP_FETCH_URL_TEMPLATE must contain the {id} placeholder".into(),
                ));
            }
        }

        Ok(Self {
            base_url,
            api_key,
            secret,
            mirror_json: flag("ROUTEPILOT_MIRROR_JSON"),
            mirror_dir: std::env::var("ROUTEPILOT_MIRROR_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("receipts")),
            snapshot_input: flag("ROUTEPILOT_SNAPSHOT_INPUT"),
            redact: flag("ROUTEPILOT_REDACT"),
            redact_fields: csv_env("ROUTEPILOT_REDACT_FIELDS"),
            usage_probe: flag("ROUTEPILOT_USAGE_PROBE"),
            early_stop: flag("ROUTEPILOT_EARLY_STOP"),
            dry_run: flag("ROUTEPILOT_DRY_RUN"),
            http_fetch: HttpFetchSettings {
                allowlist: csv_env("HTTP_FETCH_ALLOWLIST"),
                url_template,
                max,
            },
            chaos: ChaosFlags {
                primary_stall: flag("CHAOS_PRIMARY_STALL"),
                http_5xx: flag("CHAOS_HTTP_5XX"),
            },
            default_tz: std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string()),
        })
    }

    /// A config suitable for tests: points at `base_url`, everything off.
    pub fn for_tests(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: "test-key".into(),
            secret: DEFAULT_SECRET.into(),
            mirror_json: false,
            mirror_dir: PathBuf::from("receipts"),
            snapshot_input: false,
            redact: false,
            redact_fields: Vec::new(),
            usage_probe: false,
            early_stop: false,
            dry_run: false,
            http_fetch: HttpFetchSettings {
                allowlist: Vec::new(),
                url_template: None,
                max: DEFAULT_HTTP_FETCH_MAX,
            },
            chaos: ChaosFlags::default(),
            default_tz: "UTC".into(),
        }
    }
}

fn require_env(name: &str) -> Result<String, PilotError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PilotError::Config(format!("{name} is not set")))
}

fn flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var mutation is process-global; keep these assertions on the pure
    // helpers and the test constructor instead.

    #[test]
    fn test_for_tests_defaults() {
        let cfg = RuntimeConfig::for_tests("http://localhost:9999");
        assert_eq!(cfg.base_url, "http://localhost:9999");
        assert_eq!(cfg.secret, DEFAULT_SECRET);
        assert!(!cfg.redact);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.http_fetch.max, DEFAULT_HTTP_FETCH_MAX);
        assert_eq!(cfg.default_tz, "UTC");
    }

    #[test]
    fn test_chaos_flags_default_off() {
        let chaos = ChaosFlags::default();
        assert!(!chaos.primary_stall);
        assert!(!chaos.http_5xx);
    }
}

use serde::Serialize;

/// One validation problem inside a policy document.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PolicyIssue {
    /// Dotted path to the offending field (e.g. "strategy.max_attempts").
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Which quota gate rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Rpm,
    Daily,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpm => write!(f, "rpm"),
            Self::Daily => write!(f, "daily"),
        }
    }
}

/// One failed attempt inside an exhausted route ladder.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptFailure {
    pub model: String,
    pub message: String,
    pub status: Option<u16>,
}

/// Unified error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy '{name}' is invalid: {}", format_issues(issues))]
    Policy { name: String, issues: Vec<PolicyIssue> },

    #[error("Quota exceeded ({kind}): limit {limit}{}", when.as_deref().map(|d| format!(" for {d}")).unwrap_or_default())]
    Quota {
        kind: QuotaKind,
        limit: u64,
        when: Option<String>,
    },

    #[error("Gateway error ({status}): {body}")]
    Gateway { status: u16, body: String },

    #[error("All routes failed: {}", format_attempts(attempts))]
    Router { attempts: Vec<AttemptFailure> },

    #[error("Agent '{agent}' failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    Unknown(String),
}

fn format_issues(issues: &[PolicyIssue]) -> String {
    issues
        .iter()
        .map(PolicyIssue::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.model, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PilotError {
    /// Process exit code for the CLI, per sysexits conventions.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78,
            Self::Policy { .. } => 65,
            Self::Quota { .. } => 75,
            Self::Gateway { .. } | Self::Router { .. } => 69,
            _ => 1,
        }
    }

    /// Shorthand for a missing-policy error.
    pub fn policy_missing(name: &str) -> Self {
        Self::Policy {
            name: name.to_string(),
            issues: vec![PolicyIssue {
                path: String::new(),
                message: "policy not found".into(),
            }],
        }
    }
}

impl From<rusqlite::Error> for PilotError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Ledger error");
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for PilotError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unknown(err.to_string())
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unknown(format!("JSON error: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

pub mod agents;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod infer;
pub mod policy;
pub mod quota;
pub mod rates;
pub mod receipts;
pub mod router;
pub mod session;

use crate::agents::AgentRegistry;
use crate::config::RuntimeConfig;
use crate::db::Ledger;
use crate::gateway::GatewayClient;
use crate::policy::PolicyRegistry;
use crate::quota::QuotaEnforcer;
use crate::rates::RateTable;
use crate::receipts::ReceiptRecorder;

/// Shared state threaded through every driver.
pub struct PilotCtx {
    pub config: RuntimeConfig,
    pub ledger: Ledger,
    pub gateway: GatewayClient,
    /// Plain client for tool fetches (separate from the gateway client so
    /// gateway credentials never leak into tool requests).
    pub http: reqwest::Client,
    pub recorder: ReceiptRecorder,
    pub quota: QuotaEnforcer,
    pub rates: RateTable,
    pub policies: PolicyRegistry,
    pub agents: AgentRegistry,
}

impl PilotCtx {
    /// Wire the context from a config and an opened ledger. Policies and
    /// agents start empty; callers register what they loaded.
    pub fn new(config: RuntimeConfig, ledger: Ledger) -> Self {
        let gateway = GatewayClient::new(&config);
        let recorder = ReceiptRecorder::new(ledger.clone(), &config);
        let quota = QuotaEnforcer::new(ledger.clone());

        Self {
            gateway,
            http: reqwest::Client::new(),
            recorder,
            quota,
            rates: RateTable::builtin(),
            policies: PolicyRegistry::new(),
            agents: AgentRegistry::new(),
            config,
            ledger,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A context against an in-memory ledger, everything ambient off.
    pub fn test_ctx(base_url: &str) -> PilotCtx {
        PilotCtx::new(
            RuntimeConfig::for_tests(base_url),
            Ledger::open_in_memory().expect("in-memory ledger"),
        )
    }
}

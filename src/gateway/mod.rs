//! Gateway client.
//!
//! One typed call to the upstream OpenAI-compatible chat-completions
//! endpoint. The router owns supervision and retries; this module only knows
//! how to issue a request, surface a non-success status as a typed error
//! with a short body excerpt, and run the optional non-stream usage probe.

pub mod headers;
pub mod sse;

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::PilotError;
use crate::policy::GenDefaults;

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout. Streams can be long-lived.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Bytes of upstream error body carried into a gateway error.
const SHORT_BODY_LIMIT: usize = 300;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message in the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    pub r#type: &'static str,
}

/// A prepared chat-completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCall {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatCall {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            stream: true,
            temperature: None,
            top_p: None,
            stop: None,
            response_format: None,
        }
    }

    /// Apply merged generation parameters (`json_mode` maps to
    /// `response_format = {type: "json_object"}`).
    pub fn with_gen(mut self, gen: &GenDefaults) -> Self {
        self.temperature = gen.temperature;
        self.top_p = gen.top_p;
        self.stop = gen.stop.clone();
        if gen.json_mode == Some(true) {
            self.response_format = Some(ResponseFormat {
                r#type: "json_object",
            });
        }
        self
    }

    pub fn non_streaming(mut self) -> Self {
        self.stream = false;
        self
    }
}

/// Usage block of a non-stream response, read by the probe.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ProbeUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default)]
    usage: Option<ProbeUsage>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Typed client for the upstream gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl GatewayClient {
    pub fn new(config: &RuntimeConfig) -> Self {
        let http = Client::builder()
            .user_agent(concat!("routepilot/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Issue a streaming chat call. A non-success status becomes a
    /// [`PilotError::Gateway`] carrying the code and a short body excerpt.
    pub async fn chat_stream(&self, call: &ChatCall) -> Result<reqwest::Response, PilotError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(call)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PilotError::Gateway {
                status: status.as_u16(),
                body: short_body(&body),
            });
        }
        Ok(response)
    }

    /// Non-stream usage probe: same messages, `max_tokens = 1`, reads
    /// `usage.{prompt_tokens, completion_tokens}` from the JSON body.
    pub async fn probe_usage(&self, call: &ChatCall) -> Result<ProbeUsage, PilotError> {
        let mut probe = call.clone().non_streaming();
        probe.max_tokens = 1;

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&probe)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PilotError::Gateway {
                status: status.as_u16(),
                body: short_body(&body),
            });
        }

        let parsed: ProbeResponse = response.json().await?;
        Ok(parsed.usage.unwrap_or_default())
    }
}

/// Truncate an upstream body to [`SHORT_BODY_LIMIT`] bytes on a char boundary.
pub fn short_body(body: &str) -> String {
    if body.len() <= SHORT_BODY_LIMIT {
        return body.to_string();
    }
    let mut end = SHORT_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

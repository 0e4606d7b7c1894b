//! The http_fetch tool pre-fetch.
//!
//! When an agent lists the `http_fetch` tool and its input carries an
//! `ids[]` array, the controller resolves up to `HTTP_FETCH_MAX` entries
//! through a configured URL template before calling the model. The safety
//! contract is strict: http/https only, GET/HEAD, an explicit host
//! allowlist (exact or `*.suffix`), no private/loopback/link-local/ULA
//! destinations after DNS resolution, a response size cap, and a
//! content-type allowlist.

use serde_json::{json, Value};
use url::Url;

use crate::config::{HttpFetchSettings, HTTP_FETCH_MAX_BODY, HTTP_FETCH_TIMEOUT};
use crate::error::PilotError;

/// Non-JSON bodies are truncated to this many bytes before attachment.
const TEXT_ATTACH_LIMIT: usize = 5_000;

/// Is this HTTP method permitted by the tool contract?
pub fn method_allowed(method: &str) -> bool {
    matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD")
}

/// Does `host` match the allowlist (exact, or `*.suffix` wildcard)?
pub fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allowlist.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        if let Some(suffix) = entry.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == entry
        }
    })
}

/// Is this a destination we refuse to touch?
pub fn is_forbidden_addr(addr: &std::net::IpAddr) -> bool {
    match addr {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        std::net::IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7.
                || (segments[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10.
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Validate a method + URL pair against the safety contract, including DNS
/// resolution.
pub async fn check_url(
    raw: &str,
    method: &str,
    settings: &HttpFetchSettings,
) -> Result<Url, PilotError> {
    if !method_allowed(method) {
        return Err(PilotError::Unknown(format!(
            "http_fetch: method '{method}' is not allowed"
        )));
    }

    let url = Url::parse(raw)
        .map_err(|e| PilotError::Unknown(format!("http_fetch: invalid url {raw:?}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(PilotError::Unknown(format!(
                "http_fetch: scheme '{other}' is not allowed"
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| PilotError::Unknown("http_fetch: url has no host".into()))?
        .to_string();

    if !host_allowed(&host, &settings.allowlist) {
        return Err(PilotError::Unknown(format!(
            "http_fetch: host '{host}' is not on the allowlist"
        )));
    }

    // Literal addresses skip DNS but still face the range check.
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs: Vec<std::net::IpAddr> = match host.parse::<std::net::IpAddr>() {
        Ok(addr) => vec![addr],
        Err(_) => tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| PilotError::Unknown(format!("http_fetch: resolve '{host}': {e}")))?
            .map(|sa| sa.ip())
            .collect(),
    };
    if addrs.is_empty() {
        return Err(PilotError::Unknown(format!(
            "http_fetch: '{host}' resolved to no addresses"
        )));
    }
    if let Some(bad) = addrs.iter().find(|a| is_forbidden_addr(a)) {
        return Err(PilotError::Unknown(format!(
            "http_fetch: '{host}' resolves to forbidden address {bad}"
        )));
    }

    Ok(url)
}

fn content_type_allowed(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.starts_with("text/")
        || ct == "application/json"
        || ct.ends_with("+json")
        || ct == "application/xml"
        || ct.ends_with("+xml")
}

/// Fetch one id through the template. JSON bodies are parsed; anything else
/// is attached as text truncated to 5 000 bytes.
async fn fetch_one(
    client: &reqwest::Client,
    settings: &HttpFetchSettings,
    template: &str,
    id: &str,
) -> Result<Value, PilotError> {
    let raw = template.replace("{id}", id);
    let url = check_url(&raw, "GET", settings).await?;

    let response = client
        .get(url)
        .timeout(HTTP_FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| PilotError::Unknown(format!("http_fetch: request failed: {e}")))?;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !content_type_allowed(&content_type) {
        return Err(PilotError::Unknown(format!(
            "http_fetch: content-type '{content_type}' is not allowed"
        )));
    }
    if let Some(len) = response.content_length() {
        if len as usize > HTTP_FETCH_MAX_BODY {
            return Err(PilotError::Unknown(format!(
                "http_fetch: response of {len} bytes exceeds the size cap"
            )));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PilotError::Unknown(format!("http_fetch: body read failed: {e}")))?;
    if bytes.len() > HTTP_FETCH_MAX_BODY {
        return Err(PilotError::Unknown(
            "http_fetch: response exceeds the size cap".into(),
        ));
    }

    let is_json = content_type.contains("json");
    let body = if is_json {
        serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(truncate_text(&bytes)))
    } else {
        Value::String(truncate_text(&bytes))
    };

    Ok(json!({ "id": id, "status": status, "body": body }))
}

fn truncate_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut end = TEXT_ATTACH_LIMIT.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Resolve up to `settings.max` ids and bundle the results.
///
/// Returns `None` when no template is configured or `ids` is empty.
pub async fn prefetch_ids(
    client: &reqwest::Client,
    settings: &HttpFetchSettings,
    ids: &[Value],
) -> Result<Option<Value>, PilotError> {
    let Some(ref template) = settings.url_template else {
        return Ok(None);
    };
    if ids.is_empty() {
        return Ok(None);
    }

    let mut entries = Vec::new();
    for id in ids.iter().take(settings.max) {
        let id_text = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        };
        match fetch_one(client, settings, template, &id_text).await {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(id = %id_text, error = %e, "http_fetch entry failed");
                entries.push(json!({ "id": id_text, "error": e.to_string() }));
            }
        }
    }

    Ok(Some(Value::Array(entries)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(allowlist: &[&str], template: Option<&str>) -> HttpFetchSettings {
        HttpFetchSettings {
            allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            url_template: template.map(String::from),
            max: 3,
        }
    }

    #[test]
    fn test_host_allowed_exact() {
        let list = vec!["api.example.com".to_string()];
        assert!(host_allowed("api.example.com", &list));
        assert!(host_allowed("API.EXAMPLE.COM", &list));
        assert!(!host_allowed("other.example.com", &list));
    }

    #[test]
    fn test_host_allowed_wildcard() {
        let list = vec!["*.example.com".to_string()];
        assert!(host_allowed("api.example.com", &list));
        assert!(host_allowed("deep.api.example.com", &list));
        assert!(host_allowed("example.com", &list));
        assert!(!host_allowed("example.org", &list));
        assert!(!host_allowed("badexample.com", &list));
    }

    #[test]
    fn test_forbidden_addresses() {
        let cases = [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.0.1",
            "0.0.0.0",
            "::1",
            "fc00::1",
            "fd12::1",
            "fe80::1",
        ];
        for raw in cases {
            let addr: std::net::IpAddr = raw.parse().unwrap();
            assert!(is_forbidden_addr(&addr), "{raw} should be forbidden");
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        for raw in ["93.184.216.34", "2606:2800:220:1:248:1893:25c8:1946"] {
            let addr: std::net::IpAddr = raw.parse().unwrap();
            assert!(!is_forbidden_addr(&addr), "{raw} should be allowed");
        }
    }

    #[test]
    fn test_method_allowlist() {
        assert!(method_allowed("GET"));
        assert!(method_allowed("HEAD"));
        assert!(method_allowed("get"));
        assert!(!method_allowed("POST"));
        assert!(!method_allowed("DELETE"));
    }

    #[tokio::test]
    async fn test_check_url_rejects_method() {
        let s = settings(&["example.com"], None);
        let err = check_url("https://example.com/x", "POST", &s)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("method"));
    }

    #[tokio::test]
    async fn test_check_url_rejects_scheme() {
        let s = settings(&["example.com"], None);
        let err = check_url("ftp://example.com/x", "GET", &s).await.unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[tokio::test]
    async fn test_check_url_rejects_unlisted_host() {
        let s = settings(&["example.com"], None);
        let err = check_url("https://evil.test/x", "GET", &s).await.unwrap_err();
        assert!(err.to_string().contains("allowlist"));
    }

    #[tokio::test]
    async fn test_check_url_rejects_loopback_literal() {
        let s = settings(&["127.0.0.1"], None);
        let err = check_url("http://127.0.0.1/x", "GET", &s).await.unwrap_err();
        assert!(err.to_string().contains("forbidden address"));
    }

    #[test]
    fn test_content_type_allowlist() {
        assert!(content_type_allowed("application/json"));
        assert!(content_type_allowed("application/json; charset=utf-8"));
        assert!(content_type_allowed("application/problem+json"));
        assert!(content_type_allowed("text/plain"));
        assert!(content_type_allowed("application/xml"));
        assert!(!content_type_allowed("application/octet-stream"));
        assert!(!content_type_allowed("image/png"));
    }

    #[test]
    fn test_truncate_text_limit() {
        let big = "a".repeat(10_000);
        assert_eq!(truncate_text(big.as_bytes()).len(), 5_000);
    }

    #[tokio::test]
    async fn test_prefetch_without_template_is_none() {
        let s = settings(&["example.com"], None);
        let client = reqwest::Client::new();
        let out = prefetch_ids(&client, &s, &[serde_json::json!("1")])
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_prefetch_caps_at_max() {
        // All fetches fail (unlisted host), but the cap is still observable
        // through the number of entries.
        let s = settings(&[], Some("https://nowhere.test/{id}"));
        let client = reqwest::Client::new();
        let ids: Vec<_> = (0..10).map(|i| serde_json::json!(i.to_string())).collect();
        let out = prefetch_ids(&client, &s, &ids).await.unwrap().unwrap();
        assert_eq!(out.as_array().unwrap().len(), 3);
    }
}

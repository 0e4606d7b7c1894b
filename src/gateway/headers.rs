//! Token counts from response headers.
//!
//! Gateways report usage under assorted header names; anything whose name
//! contains `tokens` combined with `prompt`, `completion`, or `total` is
//! recognized. That covers `x-usage-*-tokens`, `vercel-ai-*-tokens`,
//! `openai-*-tokens`, and future variants.

use reqwest::header::HeaderMap;

/// Usage counts parsed out of response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderUsage {
    pub prompt: Option<u32>,
    pub completion: Option<u32>,
    pub total: Option<u32>,
}

impl HeaderUsage {
    /// True when neither a prompt nor a completion count was reported.
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none() && self.completion.is_none()
    }
}

/// Scan a header map for token counts.
pub fn usage_from_headers(headers: &HeaderMap) -> HeaderUsage {
    let mut usage = HeaderUsage::default();

    for (name, value) in headers {
        let name = name.as_str();
        if !name.contains("tokens") {
            continue;
        }
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok());
        let Some(count) = parsed else { continue };

        if name.contains("prompt") {
            usage.prompt.get_or_insert(count);
        } else if name.contains("completion") {
            usage.completion.get_or_insert(count);
        } else if name.contains("total") {
            usage.total.get_or_insert(count);
        }
    }

    usage
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_x_usage_family() {
        let usage = usage_from_headers(&headers(&[
            ("x-usage-prompt-tokens", "123"),
            ("x-usage-completion-tokens", "45"),
            ("x-usage-total-tokens", "168"),
        ]));
        assert_eq!(usage.prompt, Some(123));
        assert_eq!(usage.completion, Some(45));
        assert_eq!(usage.total, Some(168));
    }

    #[test]
    fn test_vercel_family() {
        let usage = usage_from_headers(&headers(&[
            ("vercel-ai-prompt-tokens", "10"),
            ("vercel-ai-completion-tokens", "20"),
        ]));
        assert_eq!(usage.prompt, Some(10));
        assert_eq!(usage.completion, Some(20));
    }

    #[test]
    fn test_generic_name_recognized() {
        let usage = usage_from_headers(&headers(&[("my-gateway-prompt-tokens-used", "7")]));
        assert_eq!(usage.prompt, Some(7));
    }

    #[test]
    fn test_unrelated_headers_ignored() {
        let usage = usage_from_headers(&headers(&[
            ("content-type", "text/event-stream"),
            ("x-prompt-something", "5"),
        ]));
        assert!(usage.is_empty());
        assert_eq!(usage.total, None);
    }

    #[test]
    fn test_non_numeric_value_ignored() {
        let usage = usage_from_headers(&headers(&[("x-usage-prompt-tokens", "many")]));
        assert_eq!(usage.prompt, None);
    }

    #[test]
    fn test_first_value_wins() {
        let usage = usage_from_headers(&headers(&[
            ("x-usage-prompt-tokens", "1"),
            ("openai-prompt-tokens", "2"),
        ]));
        // HeaderMap iteration preserves insertion order for distinct names.
        assert_eq!(usage.prompt, Some(1));
    }
}

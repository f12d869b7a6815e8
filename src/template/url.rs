//! Upstream URL construction.
//!
//! OpenAI-protocol base URLs without a version segment get `/v1` appended;
//! an explicit `auto_append_v1` override always wins over inspection.
//! Azure receives an `api-version` query parameter; Gemini and Vertex keep
//! their paths untouched.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::ProtocolKind;

const AZURE_DEFAULT_API_VERSION: &str = "2023-05-15";

fn version_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)/(?:api/)?v\d+(?:\.\d+)?(?:/|$)").expect("static regex compiles")
    })
}

fn has_versioned_path(base_url: &str) -> bool {
    let path = match reqwest::Url::parse(base_url) {
        Ok(u) => u.path().to_string(),
        Err(_) => return false,
    };
    if path.is_empty() || path == "/" {
        return false;
    }
    version_path_re().is_match(path.trim_end_matches('/'))
}

/// Join base URL and path, appending `/v1` for un-versioned OpenAI bases.
pub fn build_upstream_url(
    base_url: &str,
    upstream_path: &str,
    protocol: &ProtocolKind,
    auto_append_v1: Option<bool>,
) -> String {
    let mut base = base_url.trim_end_matches('/').to_string();
    let path = upstream_path.trim_start_matches('/');

    if matches!(protocol, ProtocolKind::OpenAi) {
        // Explicit override wins; inspection only fills the gap.
        let append = auto_append_v1.unwrap_or_else(|| !has_versioned_path(&base));
        if append && !base.is_empty() && !base.ends_with("/v1") {
            base.push_str("/v1");
        }
    }

    if path.is_empty() {
        return base;
    }
    format!("{base}/{path}")
}

/// Like [`build_upstream_url`] but also yields protocol query parameters.
pub fn build_upstream_url_with_params(
    base_url: &str,
    upstream_path: &str,
    protocol: &ProtocolKind,
    auto_append_v1: Option<bool>,
    api_version: Option<&str>,
) -> (String, Vec<(String, String)>) {
    match protocol {
        ProtocolKind::Azure => {
            let version = api_version.unwrap_or(AZURE_DEFAULT_API_VERSION);
            let url = build_upstream_url(base_url, upstream_path, protocol, Some(false));
            (url, vec![("api-version".into(), version.into())])
        }
        ProtocolKind::Gemini | ProtocolKind::Google => (
            build_upstream_url(base_url, upstream_path, protocol, Some(false)),
            Vec::new(),
        ),
        _ => (
            build_upstream_url(base_url, upstream_path, protocol, auto_append_v1),
            Vec::new(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unversioned_openai_base_gets_v1() {
        let url = build_upstream_url(
            "https://api.openai.com",
            "chat/completions",
            &ProtocolKind::OpenAi,
            None,
        );
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn versioned_base_is_left_alone() {
        let url = build_upstream_url(
            "https://gateway.example.com/api/v2",
            "chat/completions",
            &ProtocolKind::OpenAi,
            None,
        );
        assert_eq!(url, "https://gateway.example.com/api/v2/chat/completions");
    }

    #[test]
    fn explicit_override_beats_inspection() {
        // Base looks versioned, but the override forces the suffix.
        let url = build_upstream_url(
            "https://h.example.com/v2",
            "chat/completions",
            &ProtocolKind::OpenAi,
            Some(true),
        );
        assert_eq!(url, "https://h.example.com/v2/v1/chat/completions");

        // Base looks bare, but the override suppresses the suffix.
        let url = build_upstream_url(
            "https://h.example.com",
            "chat/completions",
            &ProtocolKind::OpenAi,
            Some(false),
        );
        assert_eq!(url, "https://h.example.com/chat/completions");
    }

    #[test]
    fn azure_injects_api_version_param() {
        let (url, params) = build_upstream_url_with_params(
            "https://res.openai.azure.com/openai/deployments/gpt4",
            "chat/completions",
            &ProtocolKind::Azure,
            None,
            None,
        );
        assert!(url.ends_with("/chat/completions"));
        assert_eq!(params[0].0, "api-version");
        assert_eq!(params[0].1, AZURE_DEFAULT_API_VERSION);
    }

    #[test]
    fn gemini_path_is_kept_verbatim() {
        let (url, params) = build_upstream_url_with_params(
            "https://generativelanguage.googleapis.com",
            "v1beta/models/gemini-2.0-flash:generateContent",
            &ProtocolKind::Gemini,
            None,
            None,
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert!(params.is_empty());
    }
}

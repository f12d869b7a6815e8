//! Upstream header assembly and protocol auth defaults.

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};

use crate::error::GatewayResult;
use crate::types::{AuthConfig, AuthType, ProtocolKind, UpstreamCandidate};

/// Resolve effective auth for a candidate. Presets usually carry explicit
/// auth config; `custom` providers with a known protocol fall back to that
/// protocol's conventions.
pub fn resolve_auth_for_protocol(
    protocol: &ProtocolKind,
    provider: &str,
    auth_type: AuthType,
    auth_config: &AuthConfig,
    default_headers: &HashMap<String, String>,
) -> (AuthType, AuthConfig, HashMap<String, String>) {
    let mut headers = default_headers.clone();

    if provider != "custom" {
        return (auth_type, auth_config.clone(), headers);
    }

    match protocol {
        ProtocolKind::Anthropic => {
            headers
                .entry("anthropic-version".into())
                .or_insert_with(|| "2023-06-01".into());
            (
                AuthType::ApiKey,
                AuthConfig { header: Some("x-api-key".into()), prefix: None },
                headers,
            )
        }
        ProtocolKind::Azure => (
            AuthType::ApiKey,
            AuthConfig { header: Some("api-key".into()), prefix: None },
            headers,
        ),
        ProtocolKind::Gemini | ProtocolKind::Google => (
            AuthType::ApiKey,
            AuthConfig { header: Some("x-goog-api-key".into()), prefix: None },
            headers,
        ),
        _ => (AuthType::Bearer, auth_config.clone(), headers),
    }
}

/// Assemble the final header map for a rendered request.
pub fn build_headers(
    candidate: &UpstreamCandidate,
    credential: Option<&SecretString>,
) -> GatewayResult<HashMap<String, String>> {
    let (auth_type, auth_config, mut headers) = resolve_auth_for_protocol(
        &candidate.protocol,
        &candidate.provider,
        candidate.auth_type,
        &candidate.auth_config,
        &candidate.default_headers,
    );

    headers
        .entry("content-type".into())
        .or_insert_with(|| "application/json".into());

    if let Some(secret) = credential {
        match auth_type {
            AuthType::Bearer => {
                headers.insert(
                    "authorization".into(),
                    format!("Bearer {}", secret.expose_secret()),
                );
            }
            AuthType::ApiKey => {
                let name = auth_config.header.as_deref().unwrap_or("authorization");
                let value = match &auth_config.prefix {
                    Some(prefix) => format!("{prefix}{}", secret.expose_secret()),
                    None => secret.expose_secret().to_string(),
                };
                headers.insert(name.to_ascii_lowercase(), value);
            }
            AuthType::None => {}
        }
    }

    Ok(headers)
}

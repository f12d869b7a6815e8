//! Outbound SSRF guard.
//!
//! Upstream hosts must not resolve into private, loopback or link-local
//! ranges unless internal networks are explicitly allowed, and must match
//! the outbound whitelist when one is configured.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

pub struct SsrfGuard {
    allow_internal: bool,
    whitelist: Arc<[String]>,
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (seg[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

fn host_matches(host: &str, entry: &str) -> bool {
    host == entry || host.ends_with(&format!(".{entry}"))
}

impl SsrfGuard {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            allow_internal: config.allow_internal_networks,
            whitelist: config.outbound_whitelist.clone().into(),
        }
    }

    /// Validate an upstream URL before any connection is attempted.
    pub async fn check(&self, url: &str) -> GatewayResult<()> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| GatewayError::BadRequest(format!("invalid upstream url: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::BadRequest("upstream url has no host".into()))?
            .to_string();

        if !self.whitelist.is_empty()
            && !self.whitelist.iter().any(|entry| host_matches(&host, entry))
        {
            return Err(GatewayError::UpstreamDomainNotAllowed { host });
        }

        if self.allow_internal {
            return Ok(());
        }

        // IP literals are checked directly; names resolve through the
        // system resolver so DNS-rebinding names are caught here too.
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(&ip) {
                return Err(GatewayError::UpstreamDomainNotAllowed { host });
            }
            return Ok(());
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| GatewayError::Http(format!("dns lookup failed for {host}: {e}")))?;
        for addr in addrs {
            if is_private_ip(&addr.ip()) {
                return Err(GatewayError::UpstreamDomainNotAllowed { host: host.clone() });
            }
        }
        Ok(())
    }
}

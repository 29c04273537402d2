//! Proxy header trust policy.
//!
//! Headers such as `X-Forwarded-For` are only meaningful when set by a proxy
//! the gateway trusts. For every other peer they are removed before any
//! filter sees the request.

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::header::{HeaderMap, HeaderName, FORWARDED};

use crate::config::AllowProxyHeaders;

static PROXY_HEADERS: [HeaderName; 7] = [
    FORWARDED,
    HeaderName::from_static("x-forwarded-for"),
    HeaderName::from_static("x-forwarded-host"),
    HeaderName::from_static("x-forwarded-port"),
    HeaderName::from_static("x-forwarded-proto"),
    HeaderName::from_static("x-forwarded-prefix"),
    HeaderName::from_static("x-real-ip"),
];

/// Decides whether a connection's proxy headers are honored.
#[derive(Debug, Clone)]
pub struct ProxyHeaderTrust {
    policy: AllowProxyHeaders,
    trusted_peers: Arc<[IpAddr]>,
}

impl ProxyHeaderTrust {
    pub fn new(policy: AllowProxyHeaders, trusted_peers: Vec<IpAddr>) -> Self {
        Self {
            policy,
            trusted_peers: trusted_peers.into(),
        }
    }

    pub fn policy(&self) -> AllowProxyHeaders {
        self.policy
    }

    /// `peer` is the TCP peer, not an address taken from a PROXY header.
    pub fn trusts(&self, peer: IpAddr, verified_client_cert: bool) -> bool {
        match self.policy {
            AllowProxyHeaders::Always => true,
            AllowProxyHeaders::Never => false,
            AllowProxyHeaders::MutualTls => verified_client_cert,
            AllowProxyHeaders::Allowlist => self
                .trusted_peers
                .iter()
                .any(|ip| *ip == peer || ip.to_canonical() == peer.to_canonical()),
        }
    }
}

/// Remove every proxy header. Returns how many values were dropped.
pub fn strip_untrusted(headers: &mut HeaderMap) -> usize {
    let mut removed = 0;
    for name in &PROXY_HEADERS {
        if let axum::http::header::Entry::Occupied(entry) = headers.entry(name) {
            removed += entry.remove_entry_mult().1.count();
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn policies() {
        let peer = ip("10.0.0.5");
        assert!(ProxyHeaderTrust::new(AllowProxyHeaders::Always, vec![]).trusts(peer, false));
        assert!(!ProxyHeaderTrust::new(AllowProxyHeaders::Never, vec![]).trusts(peer, true));

        let mtls = ProxyHeaderTrust::new(AllowProxyHeaders::MutualTls, vec![]);
        assert!(mtls.trusts(peer, true));
        assert!(!mtls.trusts(peer, false));

        let allowlist = ProxyHeaderTrust::new(AllowProxyHeaders::Allowlist, vec![ip("10.0.0.5")]);
        assert!(allowlist.trusts(peer, false));
        assert!(allowlist.trusts(ip("::ffff:10.0.0.5"), false));
        assert!(!allowlist.trusts(ip("10.0.0.6"), false));
    }

    #[test]
    fn strips_all_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("2.2.2.2"));
        headers.insert("forwarded", HeaderValue::from_static("for=1.1.1.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("1.1.1.1"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        assert_eq!(strip_untrusted(&mut headers), 4);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }
}

//! Upstream URL safety checking
//!
//! Every computed upstream URL passes a [`UrlSafetyCheck`] before dispatch.
//! The gateway only depends on the trait; [`RuleBasedSafetyCheck`] is the
//! default implementation with a scheme allow-list, a host deny-list, and
//! an optional private-address block for literal IP targets.

use std::net::IpAddr;
use url::Url;

use crate::config::SafetyConfig;

/// Pass/fail gate over a fully assembled upstream URL
pub trait UrlSafetyCheck: Send + Sync {
    fn is_allowed(&self, url: &Url) -> bool;
}

pub struct RuleBasedSafetyCheck {
    allowed_schemes: Vec<String>,
    blocked_hosts: Vec<String>,
    block_private_networks: bool,
}

impl RuleBasedSafetyCheck {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            allowed_schemes: config
                .allowed_schemes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            blocked_hosts: config
                .blocked_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            block_private_networks: config.block_private_networks,
        }
    }

    fn is_private_ip(ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }
    }
}

impl UrlSafetyCheck for RuleBasedSafetyCheck {
    fn is_allowed(&self, url: &Url) -> bool {
        if !self
            .allowed_schemes
            .iter()
            .any(|s| s == url.scheme())
        {
            return false;
        }

        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        if self.blocked_hosts.iter().any(|blocked| *blocked == host) {
            return false;
        }

        if self.block_private_networks {
            if let Ok(ip) = host.parse::<IpAddr>() {
                if Self::is_private_ip(ip) {
                    return false;
                }
            }
        }

        true
    }
}

/// Check that admits everything; used where the safety policy is supplied
/// externally or intentionally disabled (tests, trusted networks).
pub struct AllowAllSafetyCheck;

impl UrlSafetyCheck for AllowAllSafetyCheck {
    fn is_allowed(&self, _url: &Url) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(blocked: &[&str], block_private: bool) -> RuleBasedSafetyCheck {
        RuleBasedSafetyCheck::new(&SafetyConfig {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            blocked_hosts: blocked.iter().map(|s| s.to_string()).collect(),
            block_private_networks: block_private,
        })
    }

    #[test]
    fn test_scheme_gate() {
        let check = check(&[], false);
        assert!(check.is_allowed(&Url::parse("http://upstream:8020/items").unwrap()));
        assert!(check.is_allowed(&Url::parse("https://upstream/items").unwrap()));
        assert!(!check.is_allowed(&Url::parse("ftp://upstream/items").unwrap()));
        assert!(!check.is_allowed(&Url::parse("file:///etc/passwd").unwrap()));
    }

    #[test]
    fn test_blocked_host_is_rejected_case_insensitively() {
        let check = check(&["Internal.Corp"], false);
        assert!(!check.is_allowed(&Url::parse("http://internal.corp/x").unwrap()));
        assert!(check.is_allowed(&Url::parse("http://public.example/x").unwrap()));
    }

    #[test]
    fn test_private_ip_blocking() {
        let strict = check(&[], true);
        assert!(!strict.is_allowed(&Url::parse("http://127.0.0.1:8020/x").unwrap()));
        assert!(!strict.is_allowed(&Url::parse("http://10.1.2.3/x").unwrap()));
        assert!(!strict.is_allowed(&Url::parse("http://192.168.0.5/x").unwrap()));
        assert!(strict.is_allowed(&Url::parse("http://93.184.216.34/x").unwrap()));

        // Hostnames are not resolved here; only literal IPs are gated
        let relaxed = check(&[], false);
        assert!(relaxed.is_allowed(&Url::parse("http://127.0.0.1:8020/x").unwrap()));
    }
}

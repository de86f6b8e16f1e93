use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;

use relay_core::error::UrlViolation;
use relay_core::security::UrlPolicy;

/// Validates request targets against a [`UrlPolicy`] before any network
/// activity.
#[derive(Debug, Clone, Default)]
pub struct UrlGuard {
    policy: UrlPolicy,
}

impl UrlGuard {
    pub fn new(policy: UrlPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    /// Parse and check `target`, returning the parsed URL on success.
    pub fn check(&self, target: &str) -> Result<Url, UrlViolation> {
        let target = target.trim();
        if target.is_empty() {
            return Err(UrlViolation::Empty);
        }
        let url = Url::parse(target).map_err(|e| UrlViolation::Malformed(e.to_string()))?;
        if self.policy.disable_validation {
            return Ok(url);
        }

        if !self.policy.protocol_allowed(url.scheme()) {
            return Err(UrlViolation::ProtocolNotAllowed(url.scheme().to_string()));
        }

        let host = match url.host_str() {
            Some(h) => h.trim_start_matches('[').trim_end_matches(']').to_lowercase(),
            None => return Err(UrlViolation::Malformed(format!("no host in {}", target))),
        };

        let ip = host.parse::<IpAddr>().ok();

        if !self.policy.allow_localhost && is_localhost(&host, ip) {
            return Err(UrlViolation::LocalhostBlocked(host));
        }

        if !self.policy.allow_private_ranges {
            if let Some(range) = ip.and_then(private_range) {
                return Err(UrlViolation::PrivateRangeBlocked {
                    range: range.to_string(),
                    host,
                });
            }
        }

        Ok(url)
    }
}

fn is_localhost(host: &str, ip: Option<IpAddr>) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match ip {
        Some(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_unspecified(),
        Some(IpAddr::V6(v6)) => {
            v6.is_loopback() || v6.is_unspecified() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        None => false,
    }
}

/// Name of the private range `ip` falls in, if any.
fn private_range(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => private_v4(v4),
            None => private_v6(v6),
        },
    }
}

fn private_v4(ip: Ipv4Addr) -> Option<&'static str> {
    let [a, b, ..] = ip.octets();
    match (a, b) {
        (10, _) => Some("10.0.0.0/8"),
        (172, 16..=31) => Some("172.16.0.0/12"),
        (192, 168) => Some("192.168.0.0/16"),
        (169, 254) => Some("169.254.0.0/16"),
        (100, 64..=127) => Some("100.64.0.0/10"),
        _ => None,
    }
}

fn private_v6(ip: Ipv6Addr) -> Option<&'static str> {
    let first = ip.segments()[0];
    if first & 0xfe00 == 0xfc00 {
        Some("fc00::/7")
    } else if first & 0xffc0 == 0xfe80 {
        Some("fe80::/10")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> UrlGuard {
        UrlGuard::default()
    }

    #[test]
    fn public_https_passes() {
        let url = strict().check("https://api.example.com/v1/items?x=1").unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
    }

    #[test]
    fn empty_and_malformed() {
        assert_eq!(strict().check("  "), Err(UrlViolation::Empty));
        assert!(matches!(strict().check("not a url"), Err(UrlViolation::Malformed(_))));
    }

    #[test]
    fn protocol_must_be_listed() {
        assert_eq!(
            strict().check("ftp://files.example.com/a"),
            Err(UrlViolation::ProtocolNotAllowed("ftp".into()))
        );
    }

    #[test]
    fn localhost_variants_blocked() {
        for target in [
            "http://localhost:8080",
            "http://api.localhost",
            "http://127.0.0.1",
            "http://127.10.0.3",
            "http://[::1]/",
            "http://0.0.0.0",
        ] {
            assert!(
                matches!(strict().check(target), Err(UrlViolation::LocalhostBlocked(_))),
                "{} should be blocked",
                target
            );
        }
    }

    #[test]
    fn private_ranges_named() {
        let cases = [
            ("http://10.1.2.3", "10.0.0.0/8"),
            ("http://172.20.0.1", "172.16.0.0/12"),
            ("http://192.168.1.1", "192.168.0.0/16"),
            ("http://169.254.169.254", "169.254.0.0/16"),
            ("http://100.100.0.1", "100.64.0.0/10"),
            ("http://[fd00::1]", "fc00::/7"),
            ("http://[fe80::1]", "fe80::/10"),
        ];
        for (target, expected) in cases {
            match strict().check(target) {
                Err(UrlViolation::PrivateRangeBlocked { range, .. }) => assert_eq!(range, expected),
                other => panic!("{}: unexpected {:?}", target, other),
            }
        }
        assert!(strict().check("http://172.32.0.1").is_ok());
    }

    #[test]
    fn policy_flags_relax_checks() {
        let guard = UrlGuard::new(UrlPolicy {
            allow_localhost: true,
            allow_private_ranges: true,
            ..UrlPolicy::default()
        });
        assert!(guard.check("http://localhost:3000").is_ok());
        assert!(guard.check("http://10.0.0.1").is_ok());

        let open = UrlGuard::new(UrlPolicy::permissive());
        assert!(open.check("ftp://127.0.0.1").is_ok());
        assert_eq!(open.check(""), Err(UrlViolation::Empty));
    }
}

use serde::{Deserialize, Serialize};

/// Allow-list policy that adapters apply to every target before any
/// network activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPolicy {
    /// Permit RFC 1918, link-local, CGNAT and unique-local addresses.
    #[serde(default)]
    pub allow_private_ranges: bool,

    /// Permit `localhost` and loopback addresses.
    #[serde(default)]
    pub allow_localhost: bool,

    /// Schemes a target may use, compared case-insensitively.
    #[serde(default = "default_protocols")]
    pub allowed_protocols: Vec<String>,

    /// Skip every check.
    #[serde(default)]
    pub disable_validation: bool,
}

fn default_protocols() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allow_private_ranges: false,
            allow_localhost: false,
            allowed_protocols: default_protocols(),
            disable_validation: false,
        }
    }
}

impl UrlPolicy {
    /// A policy that accepts any target. Intended for tests and trusted
    /// internal tooling.
    pub fn permissive() -> Self {
        Self {
            disable_validation: true,
            ..Self::default()
        }
    }

    pub fn protocol_allowed(&self, scheme: &str) -> bool {
        let scheme = scheme.trim_end_matches(':');
        self.allowed_protocols
            .iter()
            .any(|p| p.trim_end_matches(':').eq_ignore_ascii_case(scheme))
    }
}

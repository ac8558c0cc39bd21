//! Caller identity and tier model.
//!
//! Admission control needs a stable per-caller identifier and a tier that
//! decides the quota caps. Identity resolution order is fixed: an
//! authenticated account wins over a client session id, which wins over the
//! client IP.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is making a generation request.
///
/// The string form (`key()`) is what the rate-limit counters are keyed by.
/// Each variant is namespaced so a session id can never collide with an
/// account id or an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    /// Resolved account id (authenticated caller).
    Account(Uuid),
    /// Client-supplied session identifier.
    Session(String),
    /// Client IP address, the identifier of last resort.
    Ip(String),
}

impl CallerIdentity {
    /// Stable counter key, e.g. `user:6a1f…`, `session:abc`, `ip:10.0.0.9`.
    pub fn key(&self) -> String {
        match self {
            CallerIdentity::Account(id) => format!("user:{id}"),
            CallerIdentity::Session(s) => format!("session:{s}"),
            CallerIdentity::Ip(ip) => format!("ip:{ip}"),
        }
    }

    /// The account id, when the caller is authenticated.
    pub fn account_id(&self) -> Option<Uuid> {
        match self {
            CallerIdentity::Account(id) => Some(*id),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CallerIdentity::Account(_) => "account",
            CallerIdentity::Session(_) => "session",
            CallerIdentity::Ip(_) => "ip",
        }
    }
}

impl std::fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Caller tier, in ascending order of quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No account: session- or IP-identified caller.
    Anonymous,
    /// Account present but no credit balance.
    Authenticated,
    /// Account with any positive credit balance.
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hourly/daily request caps for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCaps {
    pub hourly: i64,
    pub daily: i64,
}

/// Per-tier quota caps. `Default` carries the production values; individual
/// caps can be overridden from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCaps {
    pub anonymous: WindowCaps,
    pub authenticated: WindowCaps,
    pub premium: WindowCaps,
}

impl Default for TierCaps {
    fn default() -> Self {
        Self {
            anonymous: WindowCaps { hourly: 3, daily: 3 },
            authenticated: WindowCaps {
                hourly: 30,
                daily: 100,
            },
            premium: WindowCaps {
                hourly: 100,
                daily: 500,
            },
        }
    }
}

impl TierCaps {
    pub fn caps_for(&self, tier: Tier) -> WindowCaps {
        match tier {
            Tier::Anonymous => self.anonymous,
            Tier::Authenticated => self.authenticated,
            Tier::Premium => self.premium,
        }
    }

    /// Largest daily cap across tiers; the invariant checker uses this as
    /// the ceiling no counter may ever exceed.
    pub fn max_daily(&self) -> i64 {
        self.anonymous
            .daily
            .max(self.authenticated.daily)
            .max(self.premium.daily)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_are_namespaced() {
        let account = Uuid::new_v4();
        assert_eq!(
            CallerIdentity::Account(account).key(),
            format!("user:{account}")
        );
        assert_eq!(
            CallerIdentity::Session("abc123".into()).key(),
            "session:abc123"
        );
        assert_eq!(CallerIdentity::Ip("10.1.2.3".into()).key(), "ip:10.1.2.3");
    }

    #[test]
    fn default_caps_match_production_tiers() {
        let caps = TierCaps::default();
        assert_eq!(caps.caps_for(Tier::Anonymous), WindowCaps { hourly: 3, daily: 3 });
        assert_eq!(
            caps.caps_for(Tier::Authenticated),
            WindowCaps {
                hourly: 30,
                daily: 100
            }
        );
        assert_eq!(
            caps.caps_for(Tier::Premium),
            WindowCaps {
                hourly: 100,
                daily: 500
            }
        );
        assert_eq!(caps.max_daily(), 500);
    }
}

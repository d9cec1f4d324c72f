//! Cache namespaces used across the LMS backend and their TTL policy

use std::time::Duration;

use super::cache::CacheOptions;

/// Course catalogue entries and course detail pages
pub const COURSE: &str = "course";
/// User profiles and role lookups
pub const USER: &str = "user";
/// Login sessions
pub const SESSION: &str = "session";
/// Dashboard aggregates
pub const ANALYTICS: &str = "analytics";
/// Payout balances and status
pub const PAYOUT: &str = "payout";
/// Conversation lists and unread counters
pub const MESSAGE: &str = "message";

/// Default TTL for a namespace, `None` for unknown namespaces
pub fn default_ttl(namespace: &str) -> Option<Duration> {
    let secs = match namespace {
        COURSE => 3600,
        USER => 1800,
        SESSION => 86_400,
        ANALYTICS => 300,
        PAYOUT => 120,
        MESSAGE => 60,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Cache options for a namespace with its default TTL
pub fn options(namespace: &str) -> CacheOptions {
    CacheOptions {
        namespace: Some(namespace.to_string()),
        ttl: default_ttl(namespace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_namespaces_have_ttl() {
        for ns in [COURSE, USER, SESSION, ANALYTICS, PAYOUT, MESSAGE] {
            assert!(default_ttl(ns).is_some(), "{} has no ttl", ns);
        }
        assert_eq!(default_ttl("unknown"), None);
    }

    #[test]
    fn test_options_carry_namespace() {
        let opts = options(ANALYTICS);
        assert_eq!(opts.namespace.as_deref(), Some("analytics"));
        assert_eq!(opts.ttl, Some(Duration::from_secs(300)));
    }
}

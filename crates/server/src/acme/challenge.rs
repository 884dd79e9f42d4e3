//! HTTP-01 challenge responses
//!
//! The ACME client publishes a key authorization here while an order is being
//! validated; the plain HTTP listener answers
//! `/.well-known/acme-challenge/<token>` from the same map.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// A key authorization waiting to be fetched by the CA
#[derive(Debug, Clone)]
struct PendingChallenge {
    domain: String,
    key_authorization: String,
}

/// Pending HTTP-01 challenges, shared between issuance and the HTTP listener
///
/// Clones share the same map. Issuances for different hostnames run
/// concurrently, so entries are keyed by token and withdrawn one by one.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    pending: Arc<DashMap<String, PendingChallenge>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `key_authorization` available under `token` until withdrawn
    pub fn insert(&self, domain: &str, token: &str, key_authorization: &str) {
        debug!(domain = %domain, token = %token, "Publishing HTTP-01 challenge");
        self.pending.insert(
            token.to_string(),
            PendingChallenge {
                domain: domain.to_string(),
                key_authorization: key_authorization.to_string(),
            },
        );
    }

    /// Publish a challenge that is withdrawn when the guard drops
    ///
    /// Issuance can fail at any await point; dropping the guard on the way
    /// out keeps stale tokens from piling up.
    pub fn publish(&self, domain: &str, token: &str, key_authorization: &str) -> ChallengeGuard {
        self.insert(domain, token, key_authorization);
        ChallengeGuard {
            manager: self.clone(),
            token: token.to_string(),
        }
    }

    pub fn withdraw(&self, token: &str) {
        if let Some((_, challenge)) = self.pending.remove(token) {
            debug!(domain = %challenge.domain, token = %token, "Withdrew HTTP-01 challenge");
        }
    }

    /// Key authorization to serve for `token`
    pub fn key_authorization(&self, token: &str) -> Option<String> {
        let found = self
            .pending
            .get(token)
            .map(|challenge| challenge.key_authorization.clone());
        trace!(token = %token, found = found.is_some(), "HTTP-01 challenge lookup");
        found
    }

    /// Token named by a challenge request path
    ///
    /// `None` for paths outside the challenge prefix and for tokens that are
    /// empty or contain a further path segment.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Challenges currently published for `domain`
    pub fn pending_for(&self, domain: &str) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.value().domain == domain)
            .count()
    }
}

/// Withdraws its challenge on drop
#[derive(Debug)]
pub struct ChallengeGuard {
    manager: ChallengeManager,
    token: String,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        self.manager.withdraw(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_key_authorization_served() {
        let challenges = ChallengeManager::new();

        challenges.insert("login.example.net", "tok", "tok.thumb");

        assert_eq!(challenges.key_authorization("tok").as_deref(), Some("tok.thumb"));
        assert_eq!(challenges.key_authorization("other"), None);
        assert_eq!(challenges.pending_for("login.example.net"), 1);
    }

    #[test]
    fn test_guard_withdraws_on_drop() {
        let challenges = ChallengeManager::new();

        {
            let _a = challenges.publish("a.test", "tok-a", "auth-a");
            let _b = challenges.publish("b.test", "tok-b", "auth-b");
            assert_eq!(challenges.pending_count(), 2);
        }

        assert_eq!(challenges.pending_count(), 0);
    }

    #[test]
    fn test_withdraw_leaves_other_domains() {
        let challenges = ChallengeManager::new();
        challenges.insert("a.test", "tok-a", "auth-a");
        challenges.insert("b.test", "tok-b", "auth-b");

        challenges.withdraw("tok-a");
        challenges.withdraw("tok-a");

        assert_eq!(challenges.pending_for("a.test"), 0);
        assert_eq!(challenges.key_authorization("tok-b").as_deref(), Some("auth-b"));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            ChallengeManager::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(ChallengeManager::extract_token("/.well-known/acme-challenge/"), None);
        assert_eq!(ChallengeManager::extract_token("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(ChallengeManager::extract_token("/login"), None);
    }

    #[test]
    fn test_clones_share_map() {
        let challenges = ChallengeManager::new();
        let listener_view = challenges.clone();

        challenges.insert("a.test", "tok", "auth");

        assert_eq!(listener_view.key_authorization("tok").as_deref(), Some("auth"));
    }
}

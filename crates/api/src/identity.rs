//! Caller identity and tier resolution.
//!
//! Resolution order is fixed: a presented API key (verified against its
//! stored hash) or user id wins, then a client session id, then the
//! client IP. The tier follows from the resolved account's balance:
//! any positive credits is premium, an account without credits is
//! authenticated, everything else is anonymous.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use easel_billing::{AccountStore, Ledger};
use easel_shared::{CallerIdentity, Tier};

use crate::error::{ApiError, ApiResult};

/// Identity material extracted from one request.
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: String,
}

/// SHA-256 hex of an API key, the form stored in `accounts`.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Resolve the caller's identity and tier.
///
/// A presented-but-unknown API key is a hard 401; a malformed user id is
/// a validation error. Absent credentials just fall through the chain.
pub async fn resolve(
    accounts: &dyn AccountStore,
    ledger: &Ledger,
    credentials: &RequestCredentials,
) -> ApiResult<(CallerIdentity, Tier)> {
    if let Some(api_key) = &credentials.api_key {
        let account_id = accounts
            .resolve_api_key_hash(&hash_api_key(api_key))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or(ApiError::InvalidApiKey)?;
        return with_tier(ledger, account_id).await;
    }

    if let Some(user_id) = &credentials.user_id {
        let account_id = Uuid::parse_str(user_id)
            .map_err(|_| ApiError::Validation(format!("invalid userId '{user_id}'")))?;
        return with_tier(ledger, account_id).await;
    }

    if let Some(session_id) = &credentials.session_id {
        if !session_id.is_empty() {
            return Ok((CallerIdentity::Session(session_id.clone()), Tier::Anonymous));
        }
    }

    Ok((
        CallerIdentity::Ip(credentials.client_ip.clone()),
        Tier::Anonymous,
    ))
}

async fn with_tier(ledger: &Ledger, account_id: Uuid) -> ApiResult<(CallerIdentity, Tier)> {
    let balance = ledger
        .balance(account_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let tier = if balance.total() > 0 {
        Tier::Premium
    } else {
        Tier::Authenticated
    };
    Ok((CallerIdentity::Account(account_id), tier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_billing::{EntryKind, InMemoryAccountStore, InMemoryLedgerStore};
    use std::sync::Arc;

    fn fixture() -> (InMemoryAccountStore, Ledger) {
        (
            InMemoryAccountStore::new(),
            Ledger::new(Arc::new(InMemoryLedgerStore::new())),
        )
    }

    fn credentials() -> RequestCredentials {
        RequestCredentials {
            client_ip: "10.0.0.1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn api_key_resolves_account() {
        let (accounts, ledger) = fixture();
        let account = Uuid::new_v4();
        accounts.link_api_key_hash(&hash_api_key("sk_live_1"), account);

        let mut creds = credentials();
        creds.api_key = Some("sk_live_1".into());
        let (identity, tier) = resolve(&accounts, &ledger, &creds).await.unwrap();
        assert_eq!(identity, CallerIdentity::Account(account));
        assert_eq!(tier, Tier::Authenticated);
    }

    #[tokio::test]
    async fn unknown_api_key_is_unauthorized() {
        let (accounts, ledger) = fixture();
        let mut creds = credentials();
        creds.api_key = Some("sk_bogus".into());
        // Even with a session id present, a bad key never falls through.
        creds.session_id = Some("sess".into());

        assert!(matches!(
            resolve(&accounts, &ledger, &creds).await.unwrap_err(),
            ApiError::InvalidApiKey
        ));
    }

    #[tokio::test]
    async fn positive_balance_is_premium() {
        let (accounts, ledger) = fixture();
        let account = Uuid::new_v4();
        ledger
            .credit(account, 5, EntryKind::Purchase, None, "pack")
            .await
            .unwrap();

        let mut creds = credentials();
        creds.user_id = Some(account.to_string());
        let (_, tier) = resolve(&accounts, &ledger, &creds).await.unwrap();
        assert_eq!(tier, Tier::Premium);
    }

    #[tokio::test]
    async fn precedence_session_then_ip() {
        let (accounts, ledger) = fixture();

        let mut creds = credentials();
        creds.session_id = Some("sess_1".into());
        let (identity, tier) = resolve(&accounts, &ledger, &creds).await.unwrap();
        assert_eq!(identity, CallerIdentity::Session("sess_1".into()));
        assert_eq!(tier, Tier::Anonymous);

        let creds = credentials();
        let (identity, _) = resolve(&accounts, &ledger, &creds).await.unwrap();
        assert_eq!(identity, CallerIdentity::Ip("10.0.0.1".into()));
    }
}

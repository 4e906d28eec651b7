use chrono::Utc;
use std::sync::Arc;
use tollgate_core::GatewayError;
use tollgate_core::key::{KeyHasher, LOOKUP_PREFIX_LEN, Principal};
use tollgate_core::user::User;
use tollgate_store::{KeyStore, UserStore};
use tracing::debug;

/// Successful authentication: the principal plus the owning user (the
/// pipeline binds user attributes into the transform scope).
#[derive(Debug)]
pub struct AuthSuccess {
    pub principal: Principal,
    pub user: User,
}

/// API-key authenticator.
///
/// Looks the key up by its 12-char prefix bucket and verifies candidates
/// with a constant-time hash comparison, so neither timing nor bucket
/// size leaks which candidate matched.
pub struct Authenticator {
    keys: Arc<dyn KeyStore>,
    users: Arc<dyn UserStore>,
}

/// Pull the candidate secret out of the request headers:
/// `Authorization: Bearer <key>` first, then `X-API-Key`.
pub fn extract_credential<'a>(headers: &[(&'a str, &'a str)]) -> Option<&'a str> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("authorization") {
            let v = value.trim();
            if v.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("bearer ")) {
                let token = v[7..].trim();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }
    }
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-api-key"))
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty())
}

impl Authenticator {
    pub fn new(keys: Arc<dyn KeyStore>, users: Arc<dyn UserStore>) -> Self {
        Self { keys, users }
    }

    pub fn authenticate(&self, headers: &[(&str, &str)]) -> Result<AuthSuccess, GatewayError> {
        let secret = extract_credential(headers).ok_or(GatewayError::MissingCredentials)?;

        if secret.len() < LOOKUP_PREFIX_LEN {
            return Err(GatewayError::InvalidCredentials);
        }
        let prefix = secret
            .get(..LOOKUP_PREFIX_LEN)
            .ok_or(GatewayError::InvalidCredentials)?;

        let candidates = self
            .keys
            .get(prefix)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;

        let key = candidates
            .into_iter()
            .find(|k| KeyHasher::verify(&k.hash, secret))
            .ok_or(GatewayError::InvalidCredentials)?;

        let now = Utc::now();
        if key.is_revoked() {
            return Err(GatewayError::KeyRevoked);
        }
        if key.is_expired(now) {
            return Err(GatewayError::KeyExpired);
        }

        let user = self
            .users
            .get(&key.user_id)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?
            .ok_or(GatewayError::UserInactive)?;
        if !user.is_active() {
            return Err(GatewayError::UserInactive);
        }

        // Best-effort; a failed timestamp update never fails the request.
        if let Err(e) = self.keys.update_last_used(&key.id, now) {
            debug!(key_id = %key.id, error = %e, "last_used update failed");
        }

        Ok(AuthSuccess {
            principal: Principal {
                user_id: key.user_id.clone(),
                plan_id: user.plan_id.clone(),
                key_id: key.id.clone(),
                scopes: key.scopes.clone(),
            },
            user,
        })
    }
}

/// Enforce a route's scope requirement. Keys with an empty scope list
/// carry every scope.
pub fn check_scope(principal: &Principal, required: Option<&str>) -> Result<(), GatewayError> {
    let Some(required) = required else {
        return Ok(());
    };
    if principal.scopes.is_empty() || principal.scopes.iter().any(|s| s == required) {
        Ok(())
    } else {
        Err(GatewayError::ScopeInsufficient(required.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::key::{ApiKey, generate_key};
    use tollgate_store::{MemoryKeyStore, MemoryUserStore};

    fn seeded() -> (Arc<MemoryKeyStore>, Arc<MemoryUserStore>, String) {
        let keys = Arc::new(MemoryKeyStore::new());
        let users = Arc::new(MemoryUserStore::new());

        users.insert(
            serde_json::from_value(serde_json::json!({
                "id": "u1", "email": "a@b.co", "plan_id": "pro",
            }))
            .unwrap(),
        );

        let generated = generate_key("tg_");
        keys.insert(ApiKey {
            id: "k1".into(),
            user_id: "u1".into(),
            prefix: generated.prefix.clone(),
            hash: generated.hash.clone(),
            name: "test".into(),
            scopes: vec![],
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
            last_used: None,
        });

        (keys, users, generated.raw)
    }

    fn authenticator(
        keys: &Arc<MemoryKeyStore>,
        users: &Arc<MemoryUserStore>,
    ) -> Authenticator {
        Authenticator::new(keys.clone() as Arc<dyn KeyStore>, users.clone())
    }

    // ── credential extraction ──────────────────────────────────

    #[test]
    fn extracts_bearer_token() {
        let headers = [("Authorization", "Bearer tg_secret123")];
        assert_eq!(extract_credential(&headers), Some("tg_secret123"));
    }

    #[test]
    fn extracts_x_api_key() {
        let headers = [("X-API-Key", "tg_secret123")];
        assert_eq!(extract_credential(&headers), Some("tg_secret123"));
    }

    #[test]
    fn bearer_takes_precedence_over_x_api_key() {
        let headers = [("x-api-key", "from-header"), ("authorization", "bearer from-bearer")];
        assert_eq!(extract_credential(&headers), Some("from-bearer"));
    }

    #[test]
    fn non_bearer_authorization_falls_through() {
        let headers = [("Authorization", "Basic dXNlcjpwYXNz"), ("X-API-Key", "k")];
        assert_eq!(extract_credential(&headers), Some("k"));
    }

    #[test]
    fn no_credential_extracts_none() {
        assert_eq!(extract_credential(&[("Host", "x")]), None);
        assert_eq!(extract_credential(&[("X-API-Key", "  ")]), None);
    }

    // ── authentication ─────────────────────────────────────────

    #[test]
    fn valid_key_produces_principal() {
        let (keys, users, raw) = seeded();
        let auth = authenticator(&keys, &users);
        let ok = auth
            .authenticate(&[("x-api-key", raw.as_str())])
            .unwrap();
        assert_eq!(ok.principal.user_id, "u1");
        assert_eq!(ok.principal.plan_id, "pro");
        assert_eq!(ok.principal.key_id, "k1");
        assert_eq!(ok.user.email, "a@b.co");
    }

    #[test]
    fn concurrent_authentications_agree() {
        let (keys, users, raw) = seeded();
        let auth = Arc::new(authenticator(&keys, &users));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let auth = Arc::clone(&auth);
            let raw = raw.clone();
            handles.push(std::thread::spawn(move || {
                auth.authenticate(&[("x-api-key", raw.as_str())])
                    .map(|ok| ok.principal)
            }));
        }
        let principals: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert!(principals.iter().all(|p| *p == principals[0]));
    }

    #[test]
    fn missing_credentials() {
        let (keys, users, _) = seeded();
        let auth = authenticator(&keys, &users);
        let err = auth.authenticate(&[("host", "x")]).unwrap_err();
        assert_eq!(err.kind(), "missing_credentials");
    }

    #[test]
    fn short_secret_is_invalid() {
        let (keys, users, _) = seeded();
        let auth = authenticator(&keys, &users);
        let err = auth.authenticate(&[("x-api-key", "short")]).unwrap_err();
        assert_eq!(err.kind(), "invalid_credentials");
    }

    #[test]
    fn unknown_prefix_is_invalid() {
        let (keys, users, _) = seeded();
        let auth = authenticator(&keys, &users);
        let err = auth
            .authenticate(&[("x-api-key", "tg_nomatchAAAABBBBCCCCDDDD")])
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_credentials");
    }

    #[test]
    fn wrong_secret_same_prefix_is_invalid() {
        let (keys, users, raw) = seeded();
        let auth = authenticator(&keys, &users);
        // Same 12-char prefix, different tail.
        let forged = format!("{}{}", &raw[..LOOKUP_PREFIX_LEN], "XXXXXXXXXXXXXXXXXXXXXXXXXXX");
        let err = auth.authenticate(&[("x-api-key", forged.as_str())]).unwrap_err();
        assert_eq!(err.kind(), "invalid_credentials");
    }

    #[test]
    fn revoked_key_is_rejected() {
        let (keys, users, raw) = seeded();
        keys.revoke("k1", Utc::now());
        let auth = authenticator(&keys, &users);
        let err = auth.authenticate(&[("x-api-key", raw.as_str())]).unwrap_err();
        assert_eq!(err.kind(), "key_revoked");
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn expired_key_is_rejected() {
        let (keys, users, raw) = seeded();
        // Reinsert with an expiry in the past.
        let mut key = keys.get(&raw[..LOOKUP_PREFIX_LEN]).unwrap().remove(0);
        key.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        keys.insert(key);

        let auth = authenticator(&keys, &users);
        let err = auth.authenticate(&[("x-api-key", raw.as_str())]).unwrap_err();
        assert_eq!(err.kind(), "key_expired");
    }

    #[test]
    fn inactive_user_is_rejected() {
        let (keys, users, raw) = seeded();
        users.insert(
            serde_json::from_value(serde_json::json!({
                "id": "u1", "email": "a@b.co", "plan_id": "pro", "status": "suspended",
            }))
            .unwrap(),
        );
        let auth = authenticator(&keys, &users);
        let err = auth.authenticate(&[("x-api-key", raw.as_str())]).unwrap_err();
        assert_eq!(err.kind(), "user_inactive");
    }

    #[test]
    fn last_used_is_updated_on_success() {
        let (keys, users, raw) = seeded();
        let auth = authenticator(&keys, &users);
        auth.authenticate(&[("x-api-key", raw.as_str())]).unwrap();
        let key = keys.get(&raw[..LOOKUP_PREFIX_LEN]).unwrap().remove(0);
        assert!(key.last_used.is_some());
    }

    // ── scopes ─────────────────────────────────────────────────

    #[test]
    fn scope_checks() {
        let mut principal = Principal {
            user_id: "u1".into(),
            plan_id: "pro".into(),
            key_id: "k1".into(),
            scopes: vec![],
        };
        // No requirement: pass.
        assert!(check_scope(&principal, None).is_ok());
        // Empty key scopes carry everything.
        assert!(check_scope(&principal, Some("billing:read")).is_ok());

        principal.scopes = vec!["read".into()];
        assert!(check_scope(&principal, Some("read")).is_ok());
        let err = check_scope(&principal, Some("write")).unwrap_err();
        assert_eq!(err.kind(), "scope_insufficient");
        assert_eq!(err.status_code(), 403);
    }
}

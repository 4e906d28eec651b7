use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the public lookup bucket: the first 12 characters of the raw
/// key. `KeyStore::get` is indexed on this, so verification only touches
/// the handful of keys sharing a bucket.
pub const LOOKUP_PREFIX_LEN: usize = 12;

/// Length of the random portion of a generated key.
pub const SECRET_LEN: usize = 40;

/// A stored API key. Only (prefix, hash) of the secret are persisted; the
/// raw key is returned exactly once at creation and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,

    pub user_id: String,

    /// First 12 chars of the raw key, used as the lookup bucket.
    pub prefix: String,

    /// SHA-256 of the full raw key.
    #[serde(with = "b64_bytes")]
    pub hash: Vec<u8>,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Empty scope list means the key carries every scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

/// The authenticated identity attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub plan_id: String,
    pub key_id: String,
    pub scopes: Vec<String>,
}

// ── Hashing ──────────────────────────────────────────────────

/// One-way verifier over the full raw key.
pub struct KeyHasher;

impl KeyHasher {
    pub fn hash(secret: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.finalize().to_vec()
    }

    /// Constant-time comparison of a stored hash against a candidate secret.
    pub fn verify(expected: &[u8], secret: &str) -> bool {
        ct_eq(expected, &Self::hash(secret))
    }
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Issuance ─────────────────────────────────────────────────

/// Result of key generation. `raw` is handed to the caller exactly once;
/// only `prefix` and `hash` ever hit a store.
pub struct GeneratedKey {
    pub raw: String,
    pub prefix: String,
    pub hash: Vec<u8>,
}

/// Generate a fresh key: `<vanity_prefix><40 random alphanumeric chars>`.
pub fn generate_key(vanity_prefix: &str) -> GeneratedKey {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    let secret: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect();
    let raw = format!("{}{}", vanity_prefix, secret);
    let prefix: String = raw.chars().take(LOOKUP_PREFIX_LEN).collect();
    let hash = KeyHasher::hash(&raw);
    GeneratedKey { raw, prefix, hash }
}

// ── Serde helper: bytes as base64 ────────────────────────────

mod b64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

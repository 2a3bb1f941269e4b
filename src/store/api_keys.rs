//! API-key store with hashed-at-rest keys.
//!
//! A raw key is 32 random bytes, hex-encoded; it exists only in the create
//! response. At rest the store keeps `SHA-256(raw)` and exposes an 8-hex
//! prefix of that hash for display. The advisory `last_used_at` touch runs
//! on a serialized worker with its own deadline, off the request path.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{StoreError, with_deadline};

/// Raw key length in hex characters (32 bytes).
pub const RAW_KEY_LEN: usize = 64;

/// Hash-prefix length shown to users for disambiguation.
pub const PREFIX_LEN: usize = 8;

/// Maximum accepted key name length.
const MAX_NAME_LEN: usize = 255;

/// Deadline for one advisory `last_used_at` update.
const TOUCH_DEADLINE: Duration = Duration::from_secs(5);

/// Capacity of the touch worker channel; overflow drops the touch.
const TOUCH_CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by API-key operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    /// The presented key is not 64 hex characters.
    #[error("malformed API key")]
    InvalidFormat,
    /// No key with this hash (or id) exists.
    #[error("API key not found")]
    NotFound,
    /// The key exists but its expiry has passed.
    #[error("API key expired")]
    Expired,
    /// The key exists but belongs to another user.
    #[error("API key owned by another user")]
    Forbidden,
    /// Rejected create parameters (name or scopes).
    #[error("invalid API key parameters: {0}")]
    InvalidParams(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A stored API key. `key_hash` never leaves the store layer whole;
/// responses carry only [`ApiKeyRecord::prefix`].
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_hash: String,
    pub name: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Short hash prefix for user-facing identification.
    pub fn prefix(&self) -> &str {
        &self.key_hash[..PREFIX_LEN.min(self.key_hash.len())]
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Draws a fresh raw key from the thread CSPRNG.
pub fn generate_raw_key() -> String {
    let mut bytes = [0u8; RAW_KEY_LEN / 2];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of the raw key string, hex-encoded.
pub fn hash_raw_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checks the 64-hex wire format of a presented key.
pub fn is_well_formed(raw: &str) -> bool {
    raw.len() == RAW_KEY_LEN && raw.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Clone)]
pub struct ApiKeyStore {
    pool: PgPool,
    deadline: Duration,
    touch_tx: mpsc::Sender<String>,
}

impl ApiKeyStore {
    /// Builds the store and spawns its serialized touch worker.
    pub fn new(pool: PgPool, deadline: Duration, shutdown: CancellationToken) -> Self {
        let (touch_tx, touch_rx) = mpsc::channel(TOUCH_CHANNEL_CAPACITY);
        spawn_touch_worker(pool.clone(), touch_rx, shutdown);
        Self {
            pool,
            deadline,
            touch_tx,
        }
    }

    /// Creates a key and returns the raw value exactly once.
    pub async fn create(
        &self,
        user_id: Uuid,
        name: &str,
        scopes: &[String],
        ttl: Option<Duration>,
    ) -> Result<(String, ApiKeyRecord), ApiKeyError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiKeyError::InvalidParams("name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ApiKeyError::InvalidParams("name too long"));
        }
        let scopes: Vec<String> = scopes
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            return Err(ApiKeyError::InvalidParams("at least one scope is required"));
        }

        let raw = generate_raw_key();
        let key_hash = hash_raw_key(&raw);
        let id = Uuid::new_v4();
        let expires_at = ttl.map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());

        let row = with_deadline(
            self.deadline,
            sqlx::query(
                "INSERT INTO api_keys (id, user_id, key_hash, name, scopes, expires_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING id, user_id, key_hash, name, scopes, created_at, last_used_at, expires_at",
            )
            .bind(id)
            .bind(user_id)
            .bind(&key_hash)
            .bind(name)
            .bind(&scopes)
            .bind(expires_at)
            .fetch_one(&self.pool),
        )
        .await?;
        Ok((raw, row_to_record(&row)?))
    }

    /// Resolves a presented raw key to its record.
    ///
    /// Dispatches the advisory `last_used_at` touch to the worker; the
    /// request path never waits on it.
    pub async fn validate(&self, raw: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        if !is_well_formed(raw) {
            return Err(ApiKeyError::InvalidFormat);
        }
        let key_hash = hash_raw_key(raw);
        let row = with_deadline(
            self.deadline,
            sqlx::query(
                "SELECT id, user_id, key_hash, name, scopes, created_at, last_used_at, expires_at
                 FROM api_keys WHERE key_hash = $1",
            )
            .bind(&key_hash)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or(ApiKeyError::NotFound)?;
        let record = row_to_record(&row)?;
        if record.is_expired(Utc::now()) {
            return Err(ApiKeyError::Expired);
        }
        // Advisory; dropped on a full channel.
        let _ = self.touch_tx.try_send(key_hash);
        Ok(record)
    }

    /// All keys belonging to a user, newest first.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>, ApiKeyError> {
        let rows = with_deadline(
            self.deadline,
            sqlx::query(
                "SELECT id, user_id, key_hash, name, scopes, created_at, last_used_at, expires_at
                 FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Deletes a key after an ownership check.
    pub async fn revoke(&self, id: Uuid, user_id: Uuid) -> Result<(), ApiKeyError> {
        let result = with_deadline(
            self.deadline,
            sqlx::query("DELETE FROM api_keys WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool),
        )
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Distinguish a foreign key from a missing one.
        let exists = with_deadline(
            self.deadline,
            sqlx::query("SELECT 1 FROM api_keys WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        if exists.is_some() {
            Err(ApiKeyError::Forbidden)
        } else {
            Err(ApiKeyError::NotFound)
        }
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ApiKeyRecord, ApiKeyError> {
    Ok(ApiKeyRecord {
        id: row.try_get("id").map_err(StoreError::Database)?,
        user_id: row.try_get("user_id").map_err(StoreError::Database)?,
        key_hash: row.try_get("key_hash").map_err(StoreError::Database)?,
        name: row.try_get("name").map_err(StoreError::Database)?,
        scopes: row.try_get("scopes").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        last_used_at: row.try_get("last_used_at").map_err(StoreError::Database)?,
        expires_at: row.try_get("expires_at").map_err(StoreError::Database)?,
    })
}

/// Serialized worker for advisory `last_used_at` updates.
///
/// Updates run one at a time under their own deadline; failures are logged
/// and never reported to the request that triggered them.
fn spawn_touch_worker(
    pool: PgPool,
    mut rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let key_hash = tokio::select! {
                key_hash = rx.recv() => match key_hash {
                    Some(key_hash) => key_hash,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let update = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE key_hash = $1")
                .bind(&key_hash)
                .execute(&pool);
            match tokio::time::timeout(TOUCH_DEADLINE, update).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "last_used_at touch failed");
                }
                Err(_) => {
                    tracing::debug!("last_used_at touch timed out");
                }
            }
        }
    });
}

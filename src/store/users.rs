//! Identity store: chain address → internal user id.
//!
//! Users are created lazily on first successful SIWE verification. The
//! upsert relies on the unique index over the canonical address, so
//! concurrent callers for the same address converge on one row.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{StoreError, with_deadline};

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    /// Canonical (lowercase) address.
    pub address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
    deadline: Duration,
}

impl UserStore {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }

    /// Idempotent upsert by canonical address.
    ///
    /// The no-op `DO UPDATE` makes `RETURNING` yield the existing row on
    /// conflict, so concurrent first sign-ins both receive the same user.
    pub async fn get_or_create(&self, address: &str) -> Result<User, StoreError> {
        let row = with_deadline(
            self.deadline,
            sqlx::query(
                "INSERT INTO users (id, address) VALUES ($1, $2)
                 ON CONFLICT (address) DO UPDATE SET address = EXCLUDED.address
                 RETURNING id, address, created_at",
            )
            .bind(Uuid::new_v4())
            .bind(address)
            .fetch_one(&self.pool),
        )
        .await?;
        Ok(User {
            id: row.try_get("id")?,
            address: row.try_get("address")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Looks a user up by id; used to resolve API-key credentials to claims.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = with_deadline(
            self.deadline,
            sqlx::query("SELECT id, address, created_at FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(|row| {
            Ok(User {
                id: row.try_get("id")?,
                address: row.try_get("address")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(StoreError::Database)
    }
}

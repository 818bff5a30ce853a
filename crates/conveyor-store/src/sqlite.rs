//! SQLite Lease Store Implementation
//!
//! Embedded backend for the lease and checkpoint contracts, aimed at
//! single-box deployments and durable local testing. The compare-and-set is
//! expressed as conditional UPDATEs inside a transaction; `rows_affected ==
//! 0` is the CAS losing.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE leases (
//!     partition_id TEXT PRIMARY KEY,
//!     owner        TEXT NOT NULL DEFAULT '',
//!     token        TEXT NOT NULL DEFAULT '',
//!     epoch        INTEGER NOT NULL DEFAULT 0,
//!     expires_at   INTEGER NOT NULL DEFAULT 0
//! );
//! CREATE TABLE checkpoints (
//!     partition_id    TEXT PRIMARY KEY,
//!     event_offset    INTEGER NOT NULL,
//!     sequence_number INTEGER NOT NULL
//! );
//! ```
//!
//! The schema is created on open; timestamps are i64 milliseconds since
//! epoch.

use crate::error::{Result, StoreError};
use crate::types::{current_timestamp_ms, Lease};
use crate::{CheckpointStore, LeaseStore};
use async_trait::async_trait;
use conveyor_core::Checkpoint;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// SQLite-based lease and checkpoint store.
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    /// Open (or create) a store at the given file path.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(StoreError::Database)?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub async fn new_in_memory() -> Result<Self> {
        // A single connection keeps every task on the same in-memory DB.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                partition_id TEXT PRIMARY KEY,
                owner        TEXT NOT NULL DEFAULT '',
                token        TEXT NOT NULL DEFAULT '',
                epoch        INTEGER NOT NULL DEFAULT 0,
                expires_at   INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                partition_id    TEXT PRIMARY KEY,
                event_offset    INTEGER NOT NULL,
                sequence_number INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_lease(row: &sqlx::sqlite::SqliteRow) -> Result<Lease> {
        Ok(Lease {
            partition_id: row.try_get::<String, _>("partition_id")?,
            owner: row.try_get::<String, _>("owner")?,
            token: row.try_get::<String, _>("token")?,
            epoch: row.try_get::<i64, _>("epoch")? as u64,
            expires_at: row.try_get::<i64, _>("expires_at")?,
        })
    }

    async fn fetch_lease(&self, partition_id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query(
            "SELECT partition_id, owner, token, epoch, expires_at FROM leases WHERE partition_id = ?",
        )
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_lease(&row)?)),
            None => Ok(None),
        }
    }

    /// Map a failed conditional write to `NotFound` or `Conflict`.
    async fn cas_failure(&self, partition_id: &str, detail: &str) -> StoreError {
        match self.fetch_lease(partition_id).await {
            Ok(Some(_)) => StoreError::Conflict {
                partition_id: partition_id.to_string(),
                detail: detail.to_string(),
            },
            Ok(None) => StoreError::NotFound(partition_id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn ensure_store(&self) -> Result<()> {
        self.create_schema().await
    }

    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<Lease> {
        sqlx::query("INSERT OR IGNORE INTO leases (partition_id) VALUES (?)")
            .bind(partition_id)
            .execute(&self.pool)
            .await?;

        self.fetch_lease(partition_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(partition_id.to_string()))
    }

    async fn get_all_leases(&self) -> Result<Vec<Lease>> {
        let rows =
            sqlx::query("SELECT partition_id, owner, token, epoch, expires_at FROM leases")
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(Self::row_to_lease).collect()
    }

    async fn acquire(&self, lease: &Lease, owner: &str, ttl: Duration) -> Result<Lease> {
        let now = current_timestamp_ms();
        let token = Uuid::new_v4().to_string();
        let expires_at = now + ttl.as_millis() as i64;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET owner = ?, token = ?, epoch = epoch + 1, expires_at = ?
            WHERE partition_id = ?
              AND (owner = '' OR expires_at <= ? OR (token <> '' AND token = ?))
            "#,
        )
        .bind(owner)
        .bind(&token)
        .bind(expires_at)
        .bind(&lease.partition_id)
        .bind(now)
        .bind(&lease.token)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.cas_failure(&lease.partition_id, "held by another owner").await);
        }

        let row = sqlx::query(
            "SELECT partition_id, owner, token, epoch, expires_at FROM leases WHERE partition_id = ?",
        )
        .bind(&lease.partition_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Self::row_to_lease(&row)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        if lease.token.is_empty() {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: "renew without a token".to_string(),
            });
        }

        let expires_at = current_timestamp_ms() + ttl.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE leases SET expires_at = ? WHERE partition_id = ? AND token = ?",
        )
        .bind(expires_at)
        .bind(&lease.partition_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.cas_failure(&lease.partition_id, "token mismatch on renew").await);
        }

        self.fetch_lease(&lease.partition_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(lease.partition_id.clone()))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        if lease.token.is_empty() {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: "release without a token".to_string(),
            });
        }

        let result = sqlx::query(
            "UPDATE leases SET owner = '', token = '', expires_at = 0 WHERE partition_id = ? AND token = ?",
        )
        .bind(&lease.partition_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.cas_failure(&lease.partition_id, "token mismatch on release").await);
        }
        Ok(())
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease> {
        if lease.token.is_empty() {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: "update without a token".to_string(),
            });
        }

        let result =
            sqlx::query("UPDATE leases SET owner = ? WHERE partition_id = ? AND token = ?")
                .bind(&lease.owner)
                .bind(&lease.partition_id)
                .bind(&lease.token)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(self.cas_failure(&lease.partition_id, "token mismatch on update").await);
        }

        self.fetch_lease(&lease.partition_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(lease.partition_id.clone()))
    }
}

#[async_trait]
impl CheckpointStore for SqliteLeaseStore {
    async fn get_checkpoint(&self, partition_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT partition_id, event_offset, sequence_number FROM checkpoints WHERE partition_id = ?",
        )
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            Ok::<_, StoreError>(Checkpoint {
                partition_id: row.try_get::<String, _>("partition_id")?,
                offset: row.try_get::<i64, _>("event_offset")? as u64,
                sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
            })
        })
        .transpose()?)
    }

    async fn update_checkpoint(&self, lease: &Lease, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT token FROM leases WHERE partition_id = ?")
            .bind(&checkpoint.partition_id)
            .fetch_optional(&mut *tx)
            .await?;

        let stored_token: String = match row {
            Some(row) => row.try_get("token")?,
            None => return Err(StoreError::NotFound(checkpoint.partition_id.clone())),
        };

        if lease.token.is_empty() || lease.token != stored_token {
            return Err(StoreError::Fenced {
                partition_id: checkpoint.partition_id.clone(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (partition_id, event_offset, sequence_number)
            VALUES (?, ?, ?)
            ON CONFLICT(partition_id) DO UPDATE
            SET event_offset = excluded.event_offset,
                sequence_number = excluded.sequence_number
            "#,
        )
        .bind(&checkpoint.partition_id)
        .bind(checkpoint.offset as i64)
        .bind(checkpoint.sequence_number as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

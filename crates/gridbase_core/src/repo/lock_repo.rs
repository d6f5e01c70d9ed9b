//! Database-backed resource leases.
//!
//! A lease is a row in `resource_locks`. Acquisition is a single
//! compare-and-swap statement: it inserts a fresh row, or takes over a row
//! that is expired or already held by the same holder.

use crate::repo::{ensure_connection_ready, RepoResult};
use rusqlite::{params, Connection, OptionalExtension};

/// Current holder of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_key: String,
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

pub trait LockRepository {
    /// Returns `true` when `holder` owns the lease after the call.
    fn try_acquire(&self, resource_key: &str, holder: &str, now_ms: i64, ttl_ms: i64)
        -> RepoResult<bool>;
    /// Releases only if `holder` still owns it.
    fn release(&self, resource_key: &str, holder: &str) -> RepoResult<bool>;
    fn current(&self, resource_key: &str) -> RepoResult<Option<Lease>>;
}

pub struct SqliteLockRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLockRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["resource_locks"])?;
        Ok(Self { conn })
    }
}

impl LockRepository for SqliteLockRepository<'_> {
    fn try_acquire(
        &self,
        resource_key: &str,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO resource_locks (resource_key, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(resource_key) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE resource_locks.expires_at <= ?3
                OR resource_locks.holder = ?2;",
            params![resource_key, holder, now_ms, now_ms.saturating_add(ttl_ms)],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, resource_key: &str, holder: &str) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM resource_locks WHERE resource_key = ?1 AND holder = ?2;",
            params![resource_key, holder],
        )?;
        Ok(changed == 1)
    }

    fn current(&self, resource_key: &str) -> RepoResult<Option<Lease>> {
        let lease = self
            .conn
            .query_row(
                "SELECT resource_key, holder, acquired_at, expires_at
                 FROM resource_locks
                 WHERE resource_key = ?1;",
                [resource_key],
                |row| {
                    Ok(Lease {
                        resource_key: row.get(0)?,
                        holder: row.get(1)?,
                        acquired_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }
}

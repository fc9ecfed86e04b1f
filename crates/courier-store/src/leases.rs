//! Lease rows backing the server's named mutual-exclusion primitive.
//!
//! A lease is held by whoever owns the row's token until `expires_at`. Any
//! process sharing the database file may take over an expired lease, so a
//! crashed holder cannot keep a name locked past its TTL.

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Take the lease `name` for `token` until `now + ttl_ms`. Succeeds when
    /// the lease is free or expired; fails while another holder's lease is
    /// live.
    pub fn try_acquire_lease(&self, name: &str, token: &str, ttl_ms: i64, now: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO leases (name, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
             WHERE leases.expires_at <= ?4",
            params![name, token, now + ttl_ms, now],
        )?;
        Ok(affected > 0)
    }

    /// Release `name` if `token` still holds it. Returns whether a row was
    /// removed; `false` means the lease expired and was taken over or already
    /// released.
    pub fn release_lease(&self, name: &str, token: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM leases WHERE name = ?1 AND token = ?2",
            params![name, token],
        )?;
        Ok(affected > 0)
    }

    /// Drop leases that expired before `now`.
    pub fn purge_expired_leases(&self, now: i64) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM leases WHERE expires_at <= ?1", params![now])?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use crate::database::test_db;

    #[test]
    fn live_lease_excludes_other_holders() {
        let (_dir, db) = test_db();
        assert!(db.try_acquire_lease("threads_t1", "a", 30_000, 1_000).unwrap());
        assert!(!db.try_acquire_lease("threads_t1", "b", 30_000, 2_000).unwrap());
        assert!(db.try_acquire_lease("threads_t2", "b", 30_000, 2_000).unwrap());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let (_dir, db) = test_db();
        assert!(db.try_acquire_lease("threads_t1", "a", 100, 1_000).unwrap());
        assert!(db.try_acquire_lease("threads_t1", "b", 100, 1_100).unwrap());

        // The original holder no longer owns the row.
        assert!(!db.release_lease("threads_t1", "a").unwrap());
        assert!(db.release_lease("threads_t1", "b").unwrap());
    }

    #[test]
    fn release_frees_the_name() {
        let (_dir, db) = test_db();
        assert!(db.try_acquire_lease("n", "a", 30_000, 1_000).unwrap());
        assert!(db.release_lease("n", "a").unwrap());
        assert!(db.try_acquire_lease("n", "b", 30_000, 1_001).unwrap());
    }

    #[test]
    fn purge_removes_only_expired() {
        let (_dir, db) = test_db();
        db.try_acquire_lease("old", "a", 10, 1_000).unwrap();
        db.try_acquire_lease("new", "a", 10_000, 1_000).unwrap();
        assert_eq!(db.purge_expired_leases(2_000).unwrap(), 1);
    }
}

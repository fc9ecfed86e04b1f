use rusqlite::{params, OptionalExtension, Row};

use courier_shared::types::{ThreadId, ThreadKind};

use crate::database::{invalid_column, json_column, Database};
use crate::error::Result;
use crate::models::SignalThread;

const THREAD_COLUMNS: &str = "thread_id, kind, group_name, creator, all_participants, participants, admins, created_at, last_modified";

impl Database {
    pub fn find_thread(&self, thread_id: &ThreadId) -> Result<Option<SignalThread>> {
        let thread = self
            .conn()
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM signal_threads WHERE thread_id = ?1"),
                params![thread_id.as_str()],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    /// Insert or overwrite a thread record. Callers mutating an existing
    /// thread hold its lease and have re-read it first.
    pub fn save_thread(&self, thread: &SignalThread) -> Result<()> {
        self.conn().execute(
            "INSERT INTO signal_threads (thread_id, kind, group_name, creator, all_participants,
                                         participants, admins, created_at, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(thread_id) DO UPDATE SET
                group_name = excluded.group_name,
                creator = excluded.creator,
                all_participants = excluded.all_participants,
                participants = excluded.participants,
                admins = excluded.admins,
                last_modified = excluded.last_modified",
            params![
                thread.thread_id.as_str(),
                thread.kind.as_str(),
                thread.group_name,
                thread.creator,
                serde_json::to_string(&thread.all_participants)?,
                serde_json::to_string(&thread.participants)?,
                serde_json::to_string(&thread.admins)?,
                thread.created_at,
                thread.last_modified,
            ],
        )?;
        Ok(())
    }

    /// Insert `thread` unless a record with its id already exists, then return
    /// the stored record. Concurrent first messages between the same two
    /// parties therefore agree on a single thread.
    pub fn insert_thread_if_absent(&self, thread: &SignalThread) -> Result<(SignalThread, bool)> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO signal_threads (thread_id, kind, group_name, creator, all_participants,
                                                   participants, admins, created_at, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                thread.thread_id.as_str(),
                thread.kind.as_str(),
                thread.group_name,
                thread.creator,
                serde_json::to_string(&thread.all_participants)?,
                serde_json::to_string(&thread.participants)?,
                serde_json::to_string(&thread.admins)?,
                thread.created_at,
                thread.last_modified,
            ],
        )?;

        let stored = self
            .find_thread(&thread.thread_id)?
            .ok_or(crate::error::StoreError::NotFound)?;
        Ok((stored, inserted > 0))
    }

    /// Every thread `phone_full` currently participates in, most recently
    /// modified first.
    pub fn find_threads_of_user(&self, phone_full: &str) -> Result<Vec<SignalThread>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {THREAD_COLUMNS} FROM signal_threads
             WHERE EXISTS (SELECT 1 FROM json_each(signal_threads.participants) WHERE value = ?1)
             ORDER BY last_modified DESC"
        ))?;

        let rows = stmt.query_map(params![phone_full], row_to_thread)?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    pub fn count_threads(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM signal_threads", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<SignalThread> {
    let id: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let kind = ThreadKind::parse(&kind_str).ok_or_else(|| invalid_column(1, &kind_str))?;
    let all_json: String = row.get(4)?;
    let participants_json: String = row.get(5)?;
    let admins_json: String = row.get(6)?;

    Ok(SignalThread {
        thread_id: ThreadId(id),
        kind,
        group_name: row.get(2)?,
        creator: row.get(3)?,
        all_participants: json_column(4, &all_json)?,
        participants: json_column(5, &participants_json)?,
        admins: json_column(6, &admins_json)?,
        created_at: row.get(7)?,
        last_modified: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;

    fn group(id: &str, members: &[&str]) -> SignalThread {
        let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        SignalThread {
            thread_id: ThreadId::from(id),
            kind: ThreadKind::Group,
            group_name: "weekend".into(),
            creator: Some(members[0].clone()),
            all_participants: members.clone(),
            participants: members.clone(),
            admins: vec![members[0].clone()],
            created_at: 1,
            last_modified: 1,
        }
    }

    #[test]
    fn solo_insert_is_idempotent() {
        let (_dir, db) = test_db();
        let thread = SignalThread::solo("alice", "bob", 10);

        let (_, first) = db.insert_thread_if_absent(&thread).unwrap();
        let replay = SignalThread::solo("bob", "alice", 20);
        let (stored, second) = db.insert_thread_if_absent(&replay).unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(stored.created_at, 10);
        assert_eq!(db.count_threads().unwrap(), 1);
    }

    #[test]
    fn save_overwrites_membership() {
        let (_dir, db) = test_db();
        let mut thread = group("g-1", &["alice", "bob"]);
        db.save_thread(&thread).unwrap();

        thread.participants.push("carol".into());
        thread.all_participants.push("carol".into());
        thread.last_modified = 2;
        db.save_thread(&thread).unwrap();

        let loaded = db.find_thread(&ThreadId::from("g-1")).unwrap().unwrap();
        assert_eq!(loaded.participants, vec!["alice", "bob", "carol"]);
        assert_eq!(loaded.admins, vec!["alice"]);
        assert_eq!(loaded.last_modified, 2);
    }

    #[test]
    fn threads_of_user_matches_current_participants() {
        let (_dir, db) = test_db();
        db.save_thread(&group("g-1", &["alice", "bob"])).unwrap();
        let mut left = group("g-2", &["carol", "alice"]);
        left.participants.retain(|p| p != "alice");
        db.save_thread(&left).unwrap();
        db.save_thread(&SignalThread::solo("alice", "dave", 5)).unwrap();

        let threads = db.find_threads_of_user("alice").unwrap();
        let ids: Vec<&str> = threads.iter().map(|t| t.thread_id.as_str()).collect();
        assert_eq!(threads.len(), 2);
        assert!(ids.contains(&"g-1"));
        assert!(!ids.contains(&"g-2"));
    }

    #[test]
    fn unknown_thread_is_none() {
        let (_dir, db) = test_db();
        assert!(db.find_thread(&ThreadId::from("nope")).unwrap().is_none());
    }
}

//! Signal messages and their delivery-state sets.
//!
//! `receivedSessions`, `seenByUsers` and `deleteForUsers` live in child
//! tables whose primary keys make every append a set union: repeating an
//! append is a no-op and nothing is ever removed.

use std::collections::BTreeSet;

use rusqlite::{params, params_from_iter, Row};

use courier_shared::types::{ThreadId, ThreadKind};

use crate::database::{invalid_column, json_column, Database};
use crate::error::Result;
use crate::models::SignalMsg;

const MSG_COLUMNS: &str =
    "m.msg_id, m.thread_id, m.thread_kind, m.from_user, m.to_user, m.to_sessions_whitelist, m.payload, m.created_at";

/// Filter for the unreceived-for-user query.
#[derive(Debug, Clone)]
pub struct UnreceivedQuery<'a> {
    pub phone_full: &'a str,
    pub session_id: &'a str,
    /// Exclusive lower bound on `created_at`, ignored when zero.
    pub from_date: i64,
    /// Exclusive upper bound on `created_at`, ignored when zero.
    pub to_date: i64,
}

impl Database {
    /// Persist a message keyed by `msg_id`, seeding `receivedSessions` with the
    /// sender's session. Replaying the same id leaves the stored row and its
    /// sets untouched. Returns whether a new row was written.
    pub fn insert_message(&self, msg: &SignalMsg) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT INTO signal_msgs (msg_id, thread_id, thread_kind, from_user, to_user,
                                      to_sessions_whitelist, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(msg_id) DO NOTHING",
            params![
                msg.msg_id,
                msg.thread_id.as_str(),
                msg.thread_kind.as_str(),
                msg.from,
                msg.to,
                serde_json::to_string(&msg.to_sessions_whitelist)?,
                msg.payload,
                msg.created_at,
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }
        let sessions: Vec<String> = msg.received_sessions.iter().cloned().collect();
        self.append_received_session(&msg.msg_id, &sessions)?;
        Ok(true)
    }

    pub fn get_message(&self, msg_id: &str) -> Result<Option<SignalMsg>> {
        let mut found = self.query_messages(
            &format!("SELECT {MSG_COLUMNS} FROM signal_msgs m WHERE m.msg_id = ?1"),
            &[&msg_id as &dyn rusqlite::ToSql],
        )?;
        Ok(found.pop())
    }

    pub fn get_messages_by_ids(&self, msg_ids: &[String]) -> Result<Vec<SignalMsg>> {
        if msg_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; msg_ids.len()].join(", ");
        let sql = format!(
            "SELECT {MSG_COLUMNS} FROM signal_msgs m WHERE m.msg_id IN ({placeholders})
             ORDER BY m.created_at ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(msg_ids.iter()), row_to_msg)?;
        self.collect_with_sets(rows)
    }

    // -----------------------------------------------------------------------
    // Set appends
    // -----------------------------------------------------------------------

    /// `receivedSessions += sessions` for one message.
    pub fn append_received_session(&self, msg_id: &str, sessions: &[String]) -> Result<()> {
        for session in sessions.iter().filter(|s| !s.is_empty()) {
            self.conn().execute(
                "INSERT OR IGNORE INTO msg_received_sessions (msg_id, session_id)
                 SELECT msg_id, ?2 FROM signal_msgs WHERE msg_id = ?1",
                params![msg_id, session],
            )?;
        }
        Ok(())
    }

    /// `receivedSessions += session` for every listed message that exists.
    /// Returns the number of messages found.
    pub fn append_received_session_by_msg_ids(&self, msg_ids: &[String], session_id: &str) -> Result<usize> {
        let mut matched = 0;
        for msg_id in msg_ids {
            matched += self.conn().execute(
                "INSERT OR IGNORE INTO msg_received_sessions (msg_id, session_id)
                 SELECT msg_id, ?2 FROM signal_msgs WHERE msg_id = ?1",
                params![msg_id, session_id],
            )?;
        }
        Ok(matched)
    }

    /// `seenByUsers += phone_full` for every listed message that exists.
    pub fn append_seen_by_user(&self, msg_ids: &[String], phone_full: &str) -> Result<usize> {
        let mut affected = 0;
        for msg_id in msg_ids {
            affected += self.conn().execute(
                "INSERT OR IGNORE INTO msg_seen_users (msg_id, phone_full)
                 SELECT msg_id, ?2 FROM signal_msgs WHERE msg_id = ?1",
                params![msg_id, phone_full],
            )?;
        }
        Ok(affected)
    }

    /// `deleteForUsers += users` for the listed messages.
    pub fn append_delete_users_by_msg_ids(&self, msg_ids: &[String], users: &[String]) -> Result<()> {
        for msg_id in msg_ids {
            for user in users {
                self.conn().execute(
                    "INSERT OR IGNORE INTO msg_deleted_for (msg_id, phone_full)
                     SELECT msg_id, ?2 FROM signal_msgs WHERE msg_id = ?1",
                    params![msg_id, user],
                )?;
            }
        }
        Ok(())
    }

    /// `deleteForUsers += users` for every message of a thread. Returns the
    /// number of messages in the thread.
    pub fn append_delete_users_by_thread(&self, thread_id: &ThreadId, users: &[String]) -> Result<usize> {
        for user in users {
            self.conn().execute(
                "INSERT OR IGNORE INTO msg_deleted_for (msg_id, phone_full)
                 SELECT msg_id, ?2 FROM signal_msgs WHERE thread_id = ?1",
                params![thread_id.as_str(), user],
            )?;
        }
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM signal_msgs WHERE thread_id = ?1",
            params![thread_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Messages addressed to or sent by the user (or in one of the user's
    /// group threads) that this session has not acknowledged and the user has
    /// not deleted, oldest first.
    pub fn find_unreceived(&self, query: &UnreceivedQuery<'_>, page: u32, page_size: u32) -> Result<Vec<SignalMsg>> {
        let sql = format!(
            "SELECT {MSG_COLUMNS} FROM signal_msgs m
             WHERE {UNRECEIVED_FILTER}
             ORDER BY m.created_at ASC, m.rowid ASC
             LIMIT ?5 OFFSET ?6"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                query.phone_full,
                query.session_id,
                query.from_date,
                query.to_date,
                page_size,
                i64::from(page) * i64::from(page_size),
            ],
            row_to_msg,
        )?;
        self.collect_with_sets(rows)
    }

    pub fn count_unreceived(&self, query: &UnreceivedQuery<'_>) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM signal_msgs m WHERE {UNRECEIVED_FILTER}"),
            params![query.phone_full, query.session_id, query.from_date, query.to_date],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Unreceived messages of one thread. Bounds are inclusive and ignored
    /// when zero; `newest_first` selects the sort direction.
    #[allow(clippy::too_many_arguments)]
    pub fn find_unreceived_of_thread(
        &self,
        thread_id: &ThreadId,
        phone_full: &str,
        session_id: &str,
        from_date: i64,
        to_date: i64,
        newest_first: bool,
        limit: u32,
    ) -> Result<Vec<SignalMsg>> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {MSG_COLUMNS} FROM signal_msgs m
             WHERE m.thread_id = ?1
               AND NOT EXISTS (SELECT 1 FROM msg_deleted_for d WHERE d.msg_id = m.msg_id AND d.phone_full = ?2)
               AND NOT EXISTS (SELECT 1 FROM msg_received_sessions r WHERE r.msg_id = m.msg_id AND r.session_id = ?3)
               AND (?4 = 0 OR m.created_at >= ?4)
               AND (?5 = 0 OR m.created_at <= ?5)
             ORDER BY m.created_at {order}, m.rowid {order}
             LIMIT ?6"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![thread_id.as_str(), phone_full, session_id, from_date, to_date, limit],
            row_to_msg,
        )?;
        self.collect_with_sets(rows)
    }

    /// Messages of a thread created strictly before `before` (no bound when
    /// zero) that `phone_full` has not deleted, newest first.
    pub fn find_old_messages(
        &self,
        thread_id: &ThreadId,
        phone_full: &str,
        before: i64,
        limit: u32,
    ) -> Result<Vec<SignalMsg>> {
        let sql = format!(
            "SELECT {MSG_COLUMNS} FROM signal_msgs m
             WHERE m.thread_id = ?1
               AND NOT EXISTS (SELECT 1 FROM msg_deleted_for d WHERE d.msg_id = m.msg_id AND d.phone_full = ?2)
               AND (?3 = 0 OR m.created_at < ?3)
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?4"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![thread_id.as_str(), phone_full, before, limit], row_to_msg)?;
        self.collect_with_sets(rows)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn query_messages(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<SignalMsg>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(args, row_to_msg)?;
        self.collect_with_sets(rows)
    }

    fn collect_with_sets<I>(&self, rows: I) -> Result<Vec<SignalMsg>>
    where
        I: Iterator<Item = rusqlite::Result<SignalMsg>>,
    {
        let mut messages = Vec::new();
        for row in rows {
            let mut msg = row?;
            msg.received_sessions = self.load_set("msg_received_sessions", "session_id", &msg.msg_id)?;
            msg.seen_by_users = self.load_set("msg_seen_users", "phone_full", &msg.msg_id)?;
            msg.delete_for_users = self.load_set("msg_deleted_for", "phone_full", &msg.msg_id)?;
            messages.push(msg);
        }
        Ok(messages)
    }

    fn load_set(&self, table: &str, column: &str, msg_id: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn()
            .prepare_cached(&format!("SELECT {column} FROM {table} WHERE msg_id = ?1"))?;
        let rows = stmt.query_map(params![msg_id], |row| row.get::<_, String>(0))?;

        let mut set = BTreeSet::new();
        for row in rows {
            set.insert(row?);
        }
        Ok(set)
    }
}

// ?1 user, ?2 session, ?3 from_date, ?4 to_date
const UNRECEIVED_FILTER: &str = "
    (m.from_user = ?1 OR m.to_user = ?1
        OR m.thread_id IN (SELECT thread_id FROM user_group_threads WHERE phone_full = ?1))
    AND NOT EXISTS (SELECT 1 FROM msg_deleted_for d WHERE d.msg_id = m.msg_id AND d.phone_full = ?1)
    AND NOT EXISTS (SELECT 1 FROM msg_received_sessions r WHERE r.msg_id = m.msg_id AND r.session_id = ?2)
    AND (?3 = 0 OR m.created_at > ?3)
    AND (?4 = 0 OR m.created_at < ?4)";

fn row_to_msg(row: &Row<'_>) -> rusqlite::Result<SignalMsg> {
    let kind_str: String = row.get(2)?;
    let thread_kind = ThreadKind::parse(&kind_str).ok_or_else(|| invalid_column(2, &kind_str))?;
    let whitelist_json: String = row.get(5)?;

    Ok(SignalMsg {
        msg_id: row.get(0)?,
        thread_id: ThreadId(row.get(1)?),
        thread_kind,
        from: row.get(3)?,
        to: row.get(4)?,
        to_sessions_whitelist: json_column(5, &whitelist_json)?,
        received_sessions: BTreeSet::new(),
        seen_by_users: BTreeSet::new(),
        delete_for_users: BTreeSet::new(),
        payload: row.get(6)?,
        created_at: row.get(7)?,
    })
}

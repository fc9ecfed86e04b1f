use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension, Row};

use courier_shared::types::{now_millis, DeviceKind, PushSlot, ThreadId};

use crate::database::{invalid_column, not_found, Database};
use crate::error::Result;
use crate::models::{User, UserSession};

impl Database {
    /// Insert a user together with its sessions and group-thread index.
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (phone_full, phone, country_code, username, first_name, last_name, avatar, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.phone_full,
                user.phone,
                user.country_code,
                user.username,
                user.first_name,
                user.last_name,
                user.avatar,
                user.created_at,
            ],
        )?;

        for session in &user.sessions {
            self.upsert_session(&user.phone_full, session)?;
        }
        let adds: Vec<ThreadId> = user.group_threads.iter().cloned().collect();
        self.update_group_threads(&user.phone_full, &adds, &[])?;
        Ok(())
    }

    pub fn get_user(&self, phone_full: &str) -> Result<User> {
        let mut user = self
            .conn()
            .query_row(
                "SELECT phone_full, phone, country_code, username, first_name, last_name, avatar, created_at
                 FROM users WHERE phone_full = ?1",
                params![phone_full],
                row_to_user,
            )
            .map_err(not_found)?;

        user.sessions = self.get_sessions(phone_full)?;
        user.group_threads = self.get_group_threads(phone_full)?;
        Ok(user)
    }

    /// Load every user in `phones` that exists, in the given order.
    pub fn get_users(&self, phones: &[String]) -> Result<Vec<User>> {
        let mut users = Vec::with_capacity(phones.len());
        for phone in phones {
            if self.user_exists(phone)? {
                users.push(self.get_user(phone)?);
            }
        }
        Ok(users)
    }

    pub fn user_exists(&self, phone_full: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE phone_full = ?1",
                params![phone_full],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn update_profile(&self, phone_full: &str, first_name: &str, last_name: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET first_name = ?2, last_name = ?3 WHERE phone_full = ?1",
            params![phone_full, first_name, last_name],
        )?;
        Ok(affected > 0)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let phone_full: Option<String> = self
            .conn()
            .query_row(
                "SELECT phone_full FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        phone_full.map(|phone| self.get_user(&phone)).transpose()
    }

    pub fn update_username(&self, phone_full: &str, username: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET username = ?2 WHERE phone_full = ?1",
            params![phone_full, username],
        )?;
        Ok(affected > 0)
    }

    /// Users whose username contains `fragment`, ignoring ASCII case, oldest
    /// account first. Sessions and the group index are not loaded.
    pub fn search_users_by_username(&self, fragment: &str, limit: u32) -> Result<Vec<User>> {
        self.search_users(
            "SELECT phone_full, phone, country_code, username, first_name, last_name, avatar, created_at
             FROM users WHERE username IS NOT NULL AND instr(lower(username), lower(?1)) > 0
             ORDER BY created_at ASC, phone_full ASC LIMIT ?2",
            fragment,
            limit,
        )
    }

    /// Users whose full phone number contains `fragment`, oldest account
    /// first. Sessions and the group index are not loaded.
    pub fn search_users_by_phone_full(&self, fragment: &str, limit: u32) -> Result<Vec<User>> {
        self.search_users(
            "SELECT phone_full, phone, country_code, username, first_name, last_name, avatar, created_at
             FROM users WHERE instr(phone_full, ?1) > 0
             ORDER BY created_at ASC, phone_full ASC LIMIT ?2",
            fragment,
            limit,
        )
    }

    fn search_users(&self, sql: &str, fragment: &str, limit: u32) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![fragment, limit], row_to_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn upsert_session(&self, phone_full: &str, session: &UserSession) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_sessions (phone_full, session_id, device_name, device_kind, os_version,
                                        online, push_token, secondary_push_token, bundle_id, app_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(phone_full, session_id) DO UPDATE SET
                device_name = excluded.device_name,
                device_kind = excluded.device_kind,
                os_version = excluded.os_version,
                push_token = excluded.push_token,
                secondary_push_token = excluded.secondary_push_token,
                bundle_id = excluded.bundle_id,
                app_id = excluded.app_id",
            params![
                phone_full,
                session.session_id,
                session.device_name,
                session.device_kind.as_str(),
                session.os_version,
                session.online,
                session.push_token,
                session.secondary_push_token,
                session.bundle_id,
                session.app_id,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn get_sessions(&self, phone_full: &str) -> Result<Vec<UserSession>> {
        let mut stmt = self.conn().prepare(
            "SELECT session_id, device_name, device_kind, os_version, online,
                    push_token, secondary_push_token, bundle_id, app_id
             FROM user_sessions WHERE phone_full = ?1 ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![phone_full], row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Flip the live-connection flag. Returns `false` if the session is unknown.
    pub fn set_session_online(&self, phone_full: &str, session_id: &str, online: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE user_sessions SET online = ?3 WHERE phone_full = ?1 AND session_id = ?2",
            params![phone_full, session_id, online],
        )?;
        Ok(affected > 0)
    }

    /// Write a push token into one slot of a session.
    pub fn update_push_token(
        &self,
        phone_full: &str,
        session_id: &str,
        slot: PushSlot,
        token: &str,
        bundle_id: Option<&str>,
        app_id: Option<&str>,
    ) -> Result<bool> {
        let sql = match slot {
            PushSlot::Primary => {
                "UPDATE user_sessions SET push_token = ?3, bundle_id = ?4, app_id = ?5
                 WHERE phone_full = ?1 AND session_id = ?2"
            }
            PushSlot::Secondary => {
                "UPDATE user_sessions SET secondary_push_token = ?3, bundle_id = ?4, app_id = ?5
                 WHERE phone_full = ?1 AND session_id = ?2"
            }
        };
        let affected = self
            .conn()
            .execute(sql, params![phone_full, session_id, token, bundle_id, app_id])?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Group-thread membership index
    // -----------------------------------------------------------------------

    pub fn get_group_threads(&self, phone_full: &str) -> Result<BTreeSet<ThreadId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT thread_id FROM user_group_threads WHERE phone_full = ?1")?;
        let rows = stmt.query_map(params![phone_full], |row| row.get::<_, String>(0))?;

        let mut threads = BTreeSet::new();
        for row in rows {
            threads.insert(ThreadId(row?));
        }
        Ok(threads)
    }

    /// Add and remove group-thread ids from a user's membership index.
    pub fn update_group_threads(
        &self,
        phone_full: &str,
        adds: &[ThreadId],
        removes: &[ThreadId],
    ) -> Result<()> {
        for thread_id in adds {
            self.conn().execute(
                "INSERT OR IGNORE INTO user_group_threads (phone_full, thread_id) VALUES (?1, ?2)",
                params![phone_full, thread_id.as_str()],
            )?;
        }
        for thread_id in removes {
            self.conn().execute(
                "DELETE FROM user_group_threads WHERE phone_full = ?1 AND thread_id = ?2",
                params![phone_full, thread_id.as_str()],
            )?;
        }
        Ok(())
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        phone_full: row.get(0)?,
        phone: row.get(1)?,
        country_code: row.get(2)?,
        username: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        avatar: row.get(6)?,
        sessions: Vec::new(),
        group_threads: BTreeSet::new(),
        created_at: row.get(7)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<UserSession> {
    let kind: String = row.get(2)?;
    let device_kind = DeviceKind::parse(&kind).ok_or_else(|| invalid_column(2, &kind))?;

    Ok(UserSession {
        session_id: row.get(0)?,
        device_name: row.get(1)?,
        device_kind,
        os_version: row.get(3)?,
        online: row.get(4)?,
        push_token: row.get(5)?,
        secondary_push_token: row.get(6)?,
        bundle_id: row.get(7)?,
        app_id: row.get(8)?,
    })
}

/// Test fixture: a user with the given sessions and no profile.
#[cfg(test)]
pub(crate) fn sample_user(phone_full: &str, sessions: Vec<UserSession>) -> User {
    User {
        phone_full: phone_full.to_string(),
        phone: phone_full.trim_start_matches('+').to_string(),
        country_code: "1".to_string(),
        username: None,
        first_name: String::new(),
        last_name: String::new(),
        avatar: None,
        sessions,
        group_threads: BTreeSet::new(),
        created_at: now_millis(),
    }
}

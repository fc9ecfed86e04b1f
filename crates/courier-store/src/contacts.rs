use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{PhoneInUserContact, UserContact};

impl Database {
    /// The address book of `phone_full`, empty when never synced.
    pub fn get_user_contact(&self, phone_full: &str) -> Result<UserContact> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT contacts FROM user_contacts WHERE phone_full = ?1",
                params![phone_full],
                |row| row.get(0),
            )
            .optional()?;

        Ok(UserContact {
            phone_full: phone_full.to_string(),
            contacts: match raw {
                Some(json) => serde_json::from_str(&json)?,
                None => Default::default(),
            },
        })
    }

    pub fn save_user_contact(&self, record: &UserContact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_contacts (phone_full, contacts) VALUES (?1, ?2)
             ON CONFLICT(phone_full) DO UPDATE SET contacts = excluded.contacts",
            params![record.phone_full, serde_json::to_string(&record.contacts)?],
        )?;
        Ok(())
    }

    /// Everyone who holds `phone_full` in their address book.
    pub fn get_phone_in_user_contact(&self, phone_full: &str) -> Result<PhoneInUserContact> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT users FROM phone_in_user_contacts WHERE phone_full = ?1",
                params![phone_full],
                |row| row.get(0),
            )
            .optional()?;

        Ok(PhoneInUserContact {
            phone_full: phone_full.to_string(),
            users: match raw {
                Some(json) => serde_json::from_str(&json)?,
                None => Default::default(),
            },
        })
    }

    pub fn save_phone_in_user_contact(&self, record: &PhoneInUserContact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO phone_in_user_contacts (phone_full, users) VALUES (?1, ?2)
             ON CONFLICT(phone_full) DO UPDATE SET users = excluded.users",
            params![record.phone_full, serde_json::to_string(&record.users)?],
        )?;
        Ok(())
    }
}

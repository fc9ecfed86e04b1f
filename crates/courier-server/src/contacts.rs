//! Address-book sync.
//!
//! Each entry updates two records: the caller's own `UserContact` and the
//! reverse `PhoneInUserContact` index of the contact's phone number. Each
//! record is rewritten under its own lease.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use courier_store::{Contact, ContactSession, PhoneInUserContact, UserContact};

use crate::auth::Caller;
use crate::error::ServerError;
use crate::lock::{phone_in_user_contact_lock, user_contact_lock, LeaseLocker};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEntry {
    pub phone_full: String,
    pub name: String,
    pub sync: SyncKind,
}

/// A synced contact that is also a registered user.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredContact {
    pub phone_full: String,
    pub name: String,
    pub username: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub applied: usize,
    pub skipped: usize,
    pub registered: Vec<RegisteredContact>,
}

/// Apply one entry to the owner's address book on behalf of `session_id`.
pub fn apply_to_user_contact(book: &mut UserContact, session_id: &str, entry: &ContactEntry) {
    match entry.sync {
        SyncKind::Add | SyncKind::Update => {
            let contact = book
                .contacts
                .entry(entry.phone_full.clone())
                .or_insert_with(|| Contact {
                    phone_full: entry.phone_full.clone(),
                    ..Default::default()
                });
            contact.contact_name = entry.name.clone();
            contact.sessions.insert(session_id.to_string());
        }
        SyncKind::Remove => {
            if let Some(contact) = book.contacts.get_mut(&entry.phone_full) {
                contact.sessions.remove(session_id);
                if contact.sessions.is_empty() {
                    book.contacts.remove(&entry.phone_full);
                }
            }
        }
    }
}

/// Apply one entry to the reverse index of the contact's phone number.
pub fn apply_to_reverse_index(index: &mut PhoneInUserContact, owner: &str, session_id: &str, sync: SyncKind) {
    match sync {
        SyncKind::Add | SyncKind::Update => {
            index
                .users
                .entry(owner.to_string())
                .or_insert_with(|| ContactSession {
                    phone_full: owner.to_string(),
                    ..Default::default()
                })
                .sessions
                .insert(session_id.to_string());
        }
        SyncKind::Remove => {
            if let Some(holder) = index.users.get_mut(owner) {
                holder.sessions.remove(session_id);
                if holder.sessions.is_empty() {
                    index.users.remove(owner);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ContactBook {
    store: Store,
    locker: LeaseLocker,
}

impl ContactBook {
    pub fn new(store: Store, locker: LeaseLocker) -> Self {
        Self { store, locker }
    }

    pub async fn sync(&self, caller: &Caller, entries: Vec<ContactEntry>) -> Result<SyncReport, ServerError> {
        let mut report = SyncReport::default();
        let entries: Vec<ContactEntry> = entries
            .into_iter()
            .filter_map(|mut e| {
                e.name = e.name.trim().to_string();
                e.phone_full = e.phone_full.trim().to_string();
                if e.name.is_empty() || e.phone_full.is_empty() {
                    report.skipped += 1;
                    None
                } else {
                    Some(e)
                }
            })
            .collect();
        if entries.is_empty() {
            return Ok(report);
        }

        for entry in &entries {
            self.locker
                .with_lock(&phone_in_user_contact_lock(&entry.phone_full), caller.deadline, || {
                    self.store.call(|db| {
                        let mut index = db.get_phone_in_user_contact(&entry.phone_full)?;
                        apply_to_reverse_index(&mut index, caller.phone(), &caller.session_id, entry.sync);
                        db.save_phone_in_user_contact(&index)
                    })
                })
                .await?;
            report.applied += 1;
        }

        self.locker
            .with_lock(&user_contact_lock(caller.phone()), caller.deadline, || {
                self.store.call(|db| {
                    let mut book = db.get_user_contact(caller.phone())?;
                    for entry in &entries {
                        apply_to_user_contact(&mut book, &caller.session_id, entry);
                    }
                    db.save_user_contact(&book)
                })
            })
            .await?;

        let wanted: Vec<String> = entries
            .iter()
            .filter(|e| e.sync != SyncKind::Remove)
            .map(|e| e.phone_full.clone())
            .collect();
        let users = self.store.call(|db| db.get_users(&wanted))?;
        report.registered = entries
            .iter()
            .filter(|e| e.sync != SyncKind::Remove)
            .filter_map(|e| {
                users.iter().find(|u| u.phone_full == e.phone_full).map(|u| RegisteredContact {
                    phone_full: u.phone_full.clone(),
                    name: e.name.clone(),
                    username: u.username.clone(),
                    avatar: u.avatar.clone(),
                })
            })
            .collect();

        debug!(user = caller.phone(), registered = report.registered.len(), "Contact matches");
        info!(user = caller.phone(), applied = report.applied, skipped = report.skipped, "Contacts synced");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{caller, TestServer};

    fn entry(phone: &str, name: &str, sync: SyncKind) -> ContactEntry {
        ContactEntry {
            phone_full: phone.into(),
            name: name.into(),
            sync,
        }
    }

    #[test]
    fn remove_drops_contact_after_last_session() {
        let mut book = UserContact {
            phone_full: "alice".into(),
            ..Default::default()
        };
        apply_to_user_contact(&mut book, "a1", &entry("bob", "Bob", SyncKind::Add));
        apply_to_user_contact(&mut book, "a2", &entry("bob", "Bobby", SyncKind::Update));
        assert_eq!(book.contacts["bob"].contact_name, "Bobby");
        assert_eq!(book.contacts["bob"].sessions.len(), 2);

        apply_to_user_contact(&mut book, "a1", &entry("bob", "Bobby", SyncKind::Remove));
        assert!(book.contacts.contains_key("bob"));
        apply_to_user_contact(&mut book, "a2", &entry("bob", "Bobby", SyncKind::Remove));
        assert!(book.contacts.is_empty());
    }

    #[test]
    fn reverse_index_tracks_owner_sessions() {
        let mut index = PhoneInUserContact {
            phone_full: "bob".into(),
            ..Default::default()
        };
        apply_to_reverse_index(&mut index, "alice", "a1", SyncKind::Add);
        apply_to_reverse_index(&mut index, "alice", "a1", SyncKind::Update);
        assert_eq!(index.users["alice"].sessions.len(), 1);

        apply_to_reverse_index(&mut index, "alice", "a1", SyncKind::Remove);
        assert!(index.users.is_empty());
    }

    #[tokio::test]
    async fn sync_updates_both_records_and_skips_nameless() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let alice = caller(&server.state, "alice", "a1");

        let report = server
            .state
            .contacts
            .sync(
                &alice,
                vec![
                    entry("bob", "Bob", SyncKind::Add),
                    entry("stranger", "Someone", SyncKind::Add),
                    entry("nameless", "  ", SyncKind::Add),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.registered.len(), 1);
        assert_eq!(report.registered[0].phone_full, "bob");

        let book = server.store().call(|db| db.get_user_contact("alice")).unwrap();
        assert_eq!(book.contacts.len(), 2);
        let index = server.store().call(|db| db.get_phone_in_user_contact("bob")).unwrap();
        assert!(index.users["alice"].sessions.contains("a1"));
        let nameless = server
            .store()
            .call(|db| db.get_phone_in_user_contact("nameless"))
            .unwrap();
        assert!(nameless.users.is_empty());
    }
}

//! Profile and push-token updates.

use serde::Serialize;
use tracing::{debug, info, warn};

use courier_shared::constants::MAX_USER_SEARCH_RESULTS;
use courier_shared::protocol::ContactProfile;
use courier_shared::types::PushService;
use courier_store::User;

use crate::auth::Caller;
use crate::error::ServerError;
use crate::events;
use crate::notify::Notifier;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    pub first_name: String,
    pub last_name: String,
}

fn contact_profile(user: &User) -> ContactProfile {
    ContactProfile {
        phone_full: user.phone_full.clone(),
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        avatar: user.avatar.clone(),
    }
}

#[derive(Clone)]
pub struct ProfileService {
    store: Store,
    notifier: Notifier,
}

impl ProfileService {
    pub fn new(store: Store, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Store a push token in the slot the caller's device kind uses for
    /// `service`.
    pub fn update_push_token(
        &self,
        caller: &Caller,
        service: PushService,
        token: &str,
        bundle_id: Option<&str>,
        app_id: Option<&str>,
    ) -> Result<(), ServerError> {
        let session = caller
            .user
            .session(&caller.session_id)
            .ok_or_else(|| ServerError::PermissionDenied("session no longer exists".into()))?;
        let slot = session.device_kind.push_slot(service).ok_or_else(|| {
            ServerError::InvalidArgument(format!(
                "{service:?} tokens are not accepted from {} devices",
                session.device_kind.as_str()
            ))
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(ServerError::InvalidArgument("push token is empty".into()));
        }

        let updated = self.store.call(|db| {
            db.update_push_token(caller.phone(), &caller.session_id, slot, token, bundle_id, app_id)
        })?;
        if !updated {
            return Err(ServerError::NotFound(format!("session {}", caller.session_id)));
        }
        debug!(user = caller.phone(), session = %caller.session_id, ?slot, "Push token updated");
        Ok(())
    }

    /// Update the caller's name and tell everyone who has them as a contact.
    /// An empty last name keeps the current one.
    pub fn update_profile(
        &self,
        caller: &Caller,
        first_name: &str,
        last_name: &str,
    ) -> Result<ProfileView, ServerError> {
        let first_name = first_name.trim();
        if first_name.is_empty() {
            return Err(ServerError::InvalidArgument("first name is required".into()));
        }
        let last_name = match last_name.trim() {
            "" => caller.user.last_name.as_str(),
            name => name,
        };

        let user = self.store.call(|db| {
            db.update_profile(caller.phone(), first_name, last_name)?;
            db.get_user(caller.phone())
        })?;
        info!(user = %user.phone_full, "Profile updated");

        self.notify_contacts(&user);
        Ok(ProfileView {
            first_name: user.first_name,
            last_name: user.last_name,
        })
    }

    /// Claim `username` for the caller. Usernames are unique and compared
    /// exactly; re-claiming the caller's own name is also a conflict.
    pub fn update_username(&self, caller: &Caller, username: &str) -> Result<String, ServerError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServerError::InvalidArgument("username is required".into()));
        }

        let user = self.store.call(|db| {
            if db.find_user_by_username(username)?.is_some() {
                return Ok(None);
            }
            db.update_username(caller.phone(), username)?;
            db.get_user(caller.phone()).map(Some)
        })?;
        let user = user.ok_or_else(|| ServerError::AlreadyExists(format!("username {username}")))?;
        info!(user = %user.phone_full, "Username updated");

        self.notify_contacts(&user);
        Ok(username.to_string())
    }

    /// Users whose username contains `fragment`, ignoring case.
    pub fn search_by_username(&self, fragment: &str) -> Result<Vec<ContactProfile>, ServerError> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Ok(Vec::new());
        }
        let users = self
            .store
            .call(|db| db.search_users_by_username(fragment, MAX_USER_SEARCH_RESULTS))?;
        Ok(users.iter().map(contact_profile).collect())
    }

    /// Users whose full phone number contains `fragment`.
    pub fn search_by_phone_full(&self, fragment: &str) -> Result<Vec<ContactProfile>, ServerError> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Ok(Vec::new());
        }
        let users = self
            .store
            .call(|db| db.search_users_by_phone_full(fragment, MAX_USER_SEARCH_RESULTS))?;
        Ok(users.iter().map(contact_profile).collect())
    }

    /// Profiles of every listed phone that belongs to a user. Unknown and
    /// repeated numbers are skipped.
    pub fn find_by_list_phone_full(&self, phones: &[String]) -> Result<Vec<ContactProfile>, ServerError> {
        let mut wanted: Vec<String> = Vec::with_capacity(phones.len());
        for phone in phones.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            if !wanted.iter().any(|w| w == phone) {
                wanted.push(phone.to_string());
            }
        }
        let users = self.store.call(|db| db.get_users(&wanted))?;
        Ok(users.iter().map(contact_profile).collect())
    }

    /// Send a `ContactUpdated` notice to every owner holding `user` in their
    /// address book, restricted to the owner's sessions that still exist.
    fn notify_contacts(&self, user: &User) {
        let holders = match self.store.call(|db| db.get_phone_in_user_contact(&user.phone_full)) {
            Ok(record) => record.users,
            Err(e) => {
                warn!(user = %user.phone_full, error = %e, "Contact holder lookup failed");
                return;
            }
        };

        let profile = contact_profile(user);
        for (owner, holder) in holders {
            let sessions = match self.store.call(|db| db.get_sessions(&owner)) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Session lookup failed");
                    continue;
                }
            };
            let receivers: Vec<String> = holder
                .sessions
                .into_iter()
                .filter(|s| sessions.iter().any(|live| &live.session_id == s))
                .collect();
            if receivers.is_empty() {
                debug!(owner = %owner, "No live session for contact update");
                continue;
            }

            let profile = profile.clone();
            self.notifier.emit_with("contact-updated", || {
                events::contact_updated(&owner, receivers, profile)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use courier_shared::protocol::{decode_body, Envelope, SystemEvent};
    use courier_shared::types::DeviceKind;
    use courier_store::{ContactSession, PhoneInUserContact};

    use super::*;
    use crate::testkit::{caller, TestServer};

    #[tokio::test]
    async fn push_token_must_match_device_kind() {
        let server = TestServer::new();
        server.seed_user_with("droid", &[("d1", DeviceKind::Android)]);
        server.seed_user_with("fruit", &[("f1", DeviceKind::Ios)]);
        let droid = caller(&server.state, "droid", "d1");
        let fruit = caller(&server.state, "fruit", "f1");
        let users = &server.state.users;

        assert!(matches!(
            users.update_push_token(&droid, PushService::ApnsVoip, "t", None, None),
            Err(ServerError::InvalidArgument(_))
        ));
        users
            .update_push_token(&droid, PushService::Fcm, "fcm-1", None, None)
            .unwrap();
        users
            .update_push_token(&fruit, PushService::ApnsRemote, "remote-1", Some("app.bundle"), None)
            .unwrap();
        assert!(matches!(
            users.update_push_token(&fruit, PushService::Fcm, "t", None, None),
            Err(ServerError::InvalidArgument(_))
        ));

        let sessions = server.store().call(|db| db.get_sessions("fruit")).unwrap();
        assert_eq!(sessions[0].secondary_push_token.as_deref(), Some("remote-1"));
        assert_eq!(sessions[0].push_token, None);
        let sessions = server.store().call(|db| db.get_sessions("droid")).unwrap();
        assert_eq!(sessions[0].push_token(), Some("fcm-1"));
    }

    #[tokio::test]
    async fn profile_update_requires_first_name() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        let alice = caller(&server.state, "alice", "a1");

        assert!(matches!(
            server.state.users.update_profile(&alice, "   ", "X"),
            Err(ServerError::InvalidArgument(_))
        ));
        let view = server.state.users.update_profile(&alice, " Alicia ", "").unwrap();
        assert_eq!(view.first_name, "Alicia");
        assert_eq!(view.last_name, alice.user.last_name);
    }

    #[tokio::test]
    async fn username_is_unique() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let alice = caller(&server.state, "alice", "a1");
        let bob = caller(&server.state, "bob", "b1");
        let users = &server.state.users;

        assert!(matches!(
            users.update_username(&alice, "  "),
            Err(ServerError::InvalidArgument(_))
        ));
        assert_eq!(users.update_username(&alice, " wonder ").unwrap(), "wonder");
        assert!(matches!(
            users.update_username(&bob, "wonder"),
            Err(ServerError::AlreadyExists(_))
        ));
        assert!(matches!(
            users.update_username(&alice, "wonder"),
            Err(ServerError::AlreadyExists(_))
        ));

        let stored = server.store().call(|db| db.get_user("bob")).unwrap();
        assert_eq!(stored.username.as_deref(), Some("bob_name"));
    }

    #[tokio::test]
    async fn search_and_bulk_lookup() {
        let server = TestServer::new();
        server.seed_user("+15550001", &["a1"]);
        server.seed_user("+15550002", &["b1"]);
        server.seed_user("+4470003", &["c1"]);
        let users = &server.state.users;

        let hits = users.search_by_username("+1555").unwrap();
        assert_eq!(hits.len(), 2);
        assert!(users.search_by_username("   ").unwrap().is_empty());

        let hits = users.search_by_phone_full("447").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].first_name, "+4470003");

        let found = users
            .find_by_list_phone_full(&[
                "+4470003".into(),
                "+1nobody".into(),
                " +15550001 ".into(),
                "+4470003".into(),
            ])
            .unwrap();
        let phones: Vec<_> = found.iter().map(|p| p.phone_full.as_str()).collect();
        assert_eq!(phones, vec!["+4470003", "+15550001"]);
    }

    #[tokio::test]
    async fn profile_update_notifies_live_holder_sessions_only() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let alice = caller(&server.state, "alice", "a1");

        let holders = PhoneInUserContact {
            phone_full: "alice".into(),
            users: [(
                "bob".to_string(),
                ContactSession {
                    phone_full: "bob".into(),
                    sessions: BTreeSet::from(["b1".to_string(), "b-gone".to_string()]),
                },
            )]
            .into_iter()
            .collect(),
        };
        server
            .store()
            .call(|db| db.save_phone_in_user_contact(&holders))
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        server.state.registry.connect("bob", "b1", tx).await;

        server.state.users.update_profile(&alice, "Alicia", "").unwrap();
        server.drain().await;

        let frame = rx.recv().await.unwrap();
        let envelope = Envelope::from_base64(&frame.data).unwrap();
        assert_eq!(envelope.header.to, "bob");
        assert_eq!(envelope.header.to_sessions_whitelist, vec!["b1".to_string()]);
        match decode_body::<SystemEvent>(&envelope.message().unwrap().data).unwrap() {
            SystemEvent::ContactUpdated(profile) => assert_eq!(profile.first_name, "Alicia"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

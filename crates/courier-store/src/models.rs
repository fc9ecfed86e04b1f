//! Domain model structs persisted in the server database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP layer as JSON.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use courier_shared::types::{DeviceKind, ThreadId, ThreadKind};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// An account, keyed by its canonical full phone number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub phone_full: String,
    pub phone: String,
    pub country_code: String,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub avatar: Option<String>,
    /// One entry per logged-in device.
    pub sessions: Vec<UserSession>,
    /// Group threads this user currently belongs to.
    pub group_threads: BTreeSet<ThreadId>,
    /// Unix epoch millis.
    pub created_at: i64,
}

impl User {
    pub fn session(&self, session_id: &str) -> Option<&UserSession> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.session(session_id).is_some()
    }
}

/// A logged-in device of a [`User`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSession {
    pub session_id: String,
    pub device_name: String,
    pub device_kind: DeviceKind,
    pub os_version: String,
    /// Live-connection state, written only on socket connect/disconnect.
    pub online: bool,
    /// Primary push token (FCM on Android, VoIP on iOS).
    pub push_token: Option<String>,
    /// Secondary push token (remote notifications on iOS).
    pub secondary_push_token: Option<String>,
    pub bundle_id: Option<String>,
    pub app_id: Option<String>,
}

impl UserSession {
    pub fn new(session_id: impl Into<String>, device_kind: DeviceKind) -> Self {
        Self {
            session_id: session_id.into(),
            device_name: String::new(),
            device_kind,
            os_version: String::new(),
            online: false,
            push_token: None,
            secondary_push_token: None,
            bundle_id: None,
            app_id: None,
        }
    }

    /// Whether an offline wake-up can reach this device.
    pub fn push_token(&self) -> Option<&str> {
        self.push_token.as_deref().filter(|t| !t.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// A conversation, either two-party (SOLO) or admin-governed (GROUP).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalThread {
    pub thread_id: ThreadId,
    pub kind: ThreadKind,
    pub group_name: String,
    /// Group creator; unused for SOLO threads.
    pub creator: Option<String>,
    /// Every identity that was ever a participant. Only grows.
    pub all_participants: Vec<String>,
    pub participants: Vec<String>,
    pub admins: Vec<String>,
    pub created_at: i64,
    pub last_modified: i64,
}

impl SignalThread {
    /// A two-party thread between `a` and `b` with its derived id.
    pub fn solo(a: &str, b: &str, now: i64) -> Self {
        let participants = vec![a.to_string(), b.to_string()];
        Self {
            thread_id: ThreadId::solo(a, b),
            kind: ThreadKind::Solo,
            group_name: String::new(),
            creator: None,
            all_participants: participants.clone(),
            participants,
            admins: Vec::new(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_participant(&self, phone_full: &str) -> bool {
        self.participants.iter().any(|p| p == phone_full)
    }

    pub fn is_admin(&self, phone_full: &str) -> bool {
        self.admins.iter().any(|p| p == phone_full)
    }

    pub fn is_creator(&self, phone_full: &str) -> bool {
        self.creator.as_deref() == Some(phone_full)
    }

    /// The other party of a SOLO thread.
    pub fn counterpart(&self, phone_full: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.as_str() != phone_full)
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Signal message
// ---------------------------------------------------------------------------

/// A persisted signal message and its per-user / per-session delivery state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalMsg {
    pub msg_id: String,
    pub thread_id: ThreadId,
    pub thread_kind: ThreadKind,
    pub from: String,
    pub to: String,
    pub to_sessions_whitelist: Vec<String>,
    /// Sessions that acknowledged receipt. Append-only.
    pub received_sessions: BTreeSet<String>,
    /// Users that have seen the message. Append-only.
    pub seen_by_users: BTreeSet<String>,
    /// Users that soft-deleted the message. Append-only.
    pub delete_for_users: BTreeSet<String>,
    /// bincode-encoded envelope.
    pub payload: Vec<u8>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Contact relation records
// ---------------------------------------------------------------------------

/// One address-book entry of a user, with the sessions that synced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub phone_full: String,
    pub contact_name: String,
    pub sessions: BTreeSet<String>,
}

/// The address book of `phone_full`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContact {
    pub phone_full: String,
    pub contacts: BTreeMap<String, Contact>,
}

/// One owner that holds a phone number in their address book.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactSession {
    pub phone_full: String,
    pub sessions: BTreeSet<String>,
}

/// Reverse index: every owner that has `phone_full` in their address book.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhoneInUserContact {
    pub phone_full: String,
    pub users: BTreeMap<String, ContactSession>,
}

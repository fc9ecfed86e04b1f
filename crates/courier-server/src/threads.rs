//! Group and thread operations.
//!
//! Membership and admin changes re-read the thread and write it back while
//! holding the thread's lease. The pure `apply_*` functions hold the
//! transition rules; [`ThreadService`] wraps them with loading, locking,
//! persistence and the follow-up notices.

use serde::Serialize;
use tracing::{debug, info};

use courier_shared::protocol::{GroupChange, SystemEvent};
use courier_shared::types::{now_millis, ThreadId, ThreadKind};
use courier_store::{SignalThread, User};

use crate::auth::Caller;
use crate::error::ServerError;
use crate::events;
use crate::lock::{thread_lock, LeaseLocker};
use crate::notify::Notifier;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Transition rules
// ---------------------------------------------------------------------------

fn require_group(thread: &SignalThread) -> Result<(), ServerError> {
    if thread.kind != ThreadKind::Group {
        return Err(ServerError::InvalidArgument(format!(
            "{} is not a group thread",
            thread.thread_id
        )));
    }
    Ok(())
}

fn require_participant(thread: &SignalThread, who: &str) -> Result<(), ServerError> {
    if !thread.is_participant(who) {
        return Err(ServerError::PermissionDenied(format!(
            "{who} is not a participant of {}",
            thread.thread_id
        )));
    }
    Ok(())
}

fn require_admin(thread: &SignalThread, who: &str) -> Result<(), ServerError> {
    require_group(thread)?;
    if !thread.is_admin(who) {
        return Err(ServerError::PermissionDenied(format!(
            "{who} is not an admin of {}",
            thread.thread_id
        )));
    }
    Ok(())
}

fn drop_member(thread: &mut SignalThread, who: &str) {
    thread.participants.retain(|p| p != who);
    thread.admins.retain(|a| a != who);
}

pub fn apply_rename(thread: &mut SignalThread, caller: &str, name: &str, now: i64) -> Result<(), ServerError> {
    require_group(thread)?;
    require_participant(thread, caller)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ServerError::InvalidArgument("group name is empty".into()));
    }
    thread.group_name = name.to_string();
    thread.last_modified = now;
    Ok(())
}

/// Returns the members that were actually added.
pub fn apply_add_members(
    thread: &mut SignalThread,
    caller: &str,
    members: &[String],
    now: i64,
) -> Result<Vec<String>, ServerError> {
    require_admin(thread, caller)?;

    let mut added = Vec::new();
    for member in members {
        if thread.is_participant(member) || added.contains(member) {
            continue;
        }
        thread.participants.push(member.clone());
        if !thread.all_participants.contains(member) {
            thread.all_participants.push(member.clone());
        }
        added.push(member.clone());
    }
    if !added.is_empty() {
        thread.last_modified = now;
    }
    Ok(added)
}

/// Returns the members that were actually removed. `allParticipants` keeps
/// them.
pub fn apply_remove_members(
    thread: &mut SignalThread,
    caller: &str,
    members: &[String],
    now: i64,
) -> Result<Vec<String>, ServerError> {
    require_admin(thread, caller)?;
    if members.iter().any(|m| thread.is_creator(m)) && !thread.is_creator(caller) {
        return Err(ServerError::PermissionDenied(
            "only the creator can remove the creator".into(),
        ));
    }

    let mut removed = Vec::new();
    for member in members {
        if thread.is_participant(member) {
            drop_member(thread, member);
            removed.push(member.clone());
        }
    }
    if !removed.is_empty() {
        thread.last_modified = now;
    }
    Ok(removed)
}

pub fn apply_leave(thread: &mut SignalThread, caller: &str, now: i64) -> Result<(), ServerError> {
    require_group(thread)?;
    require_participant(thread, caller)?;
    drop_member(thread, caller);
    thread.last_modified = now;
    Ok(())
}

pub fn apply_promote_admin(
    thread: &mut SignalThread,
    caller: &str,
    target: &str,
    now: i64,
) -> Result<(), ServerError> {
    require_admin(thread, caller)?;
    if !thread.is_participant(target) {
        return Err(ServerError::FailedPrecondition(format!(
            "{target} is not a participant of {}",
            thread.thread_id
        )));
    }
    if thread.is_admin(target) {
        return Err(ServerError::AlreadyExists(format!("{target} is already an admin")));
    }
    thread.admins.push(target.to_string());
    thread.last_modified = now;
    Ok(())
}

pub fn apply_revoke_admin(
    thread: &mut SignalThread,
    caller: &str,
    target: &str,
    now: i64,
) -> Result<(), ServerError> {
    require_admin(thread, caller)?;
    if thread.is_creator(target) && caller != target {
        return Err(ServerError::PermissionDenied(
            "the creator's admin role can only be given up by the creator".into(),
        ));
    }
    if !thread.is_admin(target) {
        return Err(ServerError::FailedPrecondition(format!("{target} is not an admin")));
    }
    thread.admins.retain(|a| a != target);
    thread.last_modified = now;
    Ok(())
}

/// Users a delete applies to and whether it still applies to everyone.
///
/// A group delete-for-all by a non-admin silently becomes delete-for-me.
pub fn delete_scope(thread: &SignalThread, caller: &str, delete_for_all: bool) -> (Vec<String>, bool) {
    let mut users = vec![caller.to_string()];
    let for_all = delete_for_all && (thread.kind == ThreadKind::Solo || thread.is_admin(caller));
    if for_all {
        users.extend(
            thread
                .all_participants
                .iter()
                .filter(|p| p.as_str() != caller)
                .cloned(),
        );
    } else if delete_for_all {
        debug!(thread_id = %thread.thread_id, user = caller, "Delete-for-all downgraded, caller is not an admin");
    }
    (users, for_all)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Public profile of a thread participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantProfile {
    pub phone_full: String,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub avatar: Option<String>,
}

impl From<&User> for ParticipantProfile {
    fn from(user: &User) -> Self {
        Self {
            phone_full: user.phone_full.clone(),
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            avatar: user.avatar.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub thread: SignalThread,
    pub members: Vec<ParticipantProfile>,
}

/// Result of a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub count: usize,
    pub delete_for_all: bool,
}

#[derive(Clone)]
pub struct ThreadService {
    store: Store,
    locker: LeaseLocker,
    notifier: Notifier,
}

impl ThreadService {
    pub fn new(store: Store, locker: LeaseLocker, notifier: Notifier) -> Self {
        Self {
            store,
            locker,
            notifier,
        }
    }

    fn load(&self, thread_id: &ThreadId) -> Result<SignalThread, ServerError> {
        self.store
            .call(|db| db.find_thread(thread_id))?
            .ok_or_else(|| ServerError::NotFound(format!("thread {thread_id}")))
    }

    /// Re-read, mutate and save `thread_id` under its lease.
    async fn mutate<T>(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        apply: impl FnOnce(&mut SignalThread, i64) -> Result<T, ServerError>,
    ) -> Result<(SignalThread, T), ServerError> {
        self.locker
            .with_lock(&thread_lock(thread_id), caller.deadline, || {
                let mut thread = self.load(thread_id)?;
                let outcome = apply(&mut thread, now_millis())?;
                self.store.call(|db| db.save_thread(&thread))?;
                Ok((thread, outcome))
            })
            .await
    }

    fn notify_group(&self, thread: &SignalThread, change: GroupChange, caller: &Caller, targets: Vec<String>) {
        self.notifier.emit_with("group-notification", || {
            events::group_notification(thread, change, &caller.user, &caller.session_id, targets)
        });
    }

    fn notify_event(&self, thread: &SignalThread, caller: &Caller, event: SystemEvent) {
        self.notifier.emit_with("thread-event", || {
            events::thread_event(thread, &caller.user, &caller.session_id, event)
        });
    }

    fn profiles(&self, phones: &[String]) -> Result<Vec<ParticipantProfile>, ServerError> {
        let users = self.store.call(|db| db.get_users(phones))?;
        Ok(users.iter().map(ParticipantProfile::from).collect())
    }

    fn require_known(&self, phones: &[String]) -> Result<(), ServerError> {
        let known = self.store.call(|db| db.get_users(phones))?;
        match phones
            .iter()
            .find(|p| !known.iter().any(|u| &u.phone_full == *p))
        {
            Some(unknown) => Err(ServerError::InvalidArgument(format!("unknown participant {unknown}"))),
            None => Ok(()),
        }
    }

    pub async fn create_group(
        &self,
        caller: &Caller,
        group_name: &str,
        participants: &[String],
    ) -> Result<ThreadInfo, ServerError> {
        let mut members: Vec<String> = Vec::new();
        for p in participants.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            if !members.iter().any(|m| m == p) {
                members.push(p.to_string());
            }
        }
        if !members.iter().any(|m| m == caller.phone()) {
            return Err(ServerError::InvalidArgument(
                "participants must include the caller".into(),
            ));
        }

        let profiles = self.profiles(&members)?;
        if let Some(unknown) = members
            .iter()
            .find(|m| !profiles.iter().any(|p| &p.phone_full == *m))
        {
            return Err(ServerError::InvalidArgument(format!("unknown participant {unknown}")));
        }

        let now = now_millis();
        let thread = SignalThread {
            thread_id: ThreadId::new_group(),
            kind: ThreadKind::Group,
            group_name: group_name.trim().to_string(),
            creator: Some(caller.phone().to_string()),
            all_participants: members.clone(),
            participants: members.clone(),
            admins: vec![caller.phone().to_string()],
            created_at: now,
            last_modified: now,
        };

        let thread_id = thread.thread_id.clone();
        self.store.call(|db| {
            db.save_thread(&thread)?;
            for member in &members {
                db.update_group_threads(member, std::slice::from_ref(&thread_id), &[])?;
            }
            Ok(())
        })?;

        info!(thread_id = %thread.thread_id.short(), members = members.len(), "Group created");
        self.notify_group(&thread, GroupChange::Created, caller, Vec::new());
        Ok(ThreadInfo {
            thread,
            members: profiles,
        })
    }

    pub fn info(&self, caller: &Caller, thread_id: &ThreadId) -> Result<ThreadInfo, ServerError> {
        let thread = self.load(thread_id)?;
        require_participant(&thread, caller.phone())?;
        let members = self.profiles(&thread.participants)?;
        Ok(ThreadInfo { thread, members })
    }

    pub async fn rename(&self, caller: &Caller, thread_id: &ThreadId, name: &str) -> Result<SignalThread, ServerError> {
        let (thread, ()) = self
            .mutate(caller, thread_id, |t, now| apply_rename(t, caller.phone(), name, now))
            .await?;
        self.notify_group(&thread, GroupChange::Renamed, caller, Vec::new());
        Ok(thread)
    }

    pub async fn add_members(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        members: &[String],
    ) -> Result<SignalThread, ServerError> {
        let (thread, added) = self
            .mutate(caller, thread_id, |t, now| {
                require_admin(t, caller.phone())?;
                self.require_known(members)?;
                apply_add_members(t, caller.phone(), members, now)
            })
            .await?;
        if added.is_empty() {
            return Ok(thread);
        }

        self.store.call(|db| {
            for member in &added {
                db.update_group_threads(member, std::slice::from_ref(thread_id), &[])?;
            }
            Ok(())
        })?;
        info!(thread_id = %thread_id.short(), added = added.len(), "Members added");
        self.notify_group(&thread, GroupChange::MembersAdded, caller, added);
        Ok(thread)
    }

    pub async fn remove_members(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        members: &[String],
    ) -> Result<SignalThread, ServerError> {
        let (thread, removed) = self
            .mutate(caller, thread_id, |t, now| apply_remove_members(t, caller.phone(), members, now))
            .await?;
        if removed.is_empty() {
            return Ok(thread);
        }

        self.store.call(|db| {
            for member in &removed {
                db.update_group_threads(member, &[], std::slice::from_ref(thread_id))?;
            }
            Ok(())
        })?;
        info!(thread_id = %thread_id.short(), removed = removed.len(), "Members removed");
        self.notify_group(&thread, GroupChange::MembersRemoved, caller, removed);
        Ok(thread)
    }

    async fn leave_inner(&self, caller: &Caller, thread_id: &ThreadId) -> Result<SignalThread, ServerError> {
        let (thread, ()) = self
            .mutate(caller, thread_id, |t, now| apply_leave(t, caller.phone(), now))
            .await?;
        self.store
            .call(|db| db.update_group_threads(caller.phone(), &[], std::slice::from_ref(thread_id)))?;
        info!(thread_id = %thread_id.short(), user = caller.phone(), "Left group");
        Ok(thread)
    }

    pub async fn leave(&self, caller: &Caller, thread_id: &ThreadId) -> Result<SignalThread, ServerError> {
        let thread = self.leave_inner(caller, thread_id).await?;
        self.notify_group(&thread, GroupChange::Left, caller, Vec::new());
        Ok(thread)
    }

    /// Leave the group and hide its whole history from the caller.
    pub async fn delete_and_leave(&self, caller: &Caller, thread_id: &ThreadId) -> Result<SignalThread, ServerError> {
        let thread = self.leave_inner(caller, thread_id).await?;
        let hidden = self.store.call(|db| {
            db.append_delete_users_by_thread(thread_id, &[caller.phone().to_string()])
        })?;
        debug!(thread_id = %thread_id.short(), hidden, "History hidden after leaving");

        self.notify_group(&thread, GroupChange::Left, caller, Vec::new());
        self.notify_event(
            &thread,
            caller,
            SystemEvent::ThreadDeleted {
                thread_id: thread_id.clone(),
                delete_for_all: false,
            },
        );
        Ok(thread)
    }

    pub async fn promote_admin(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        target: &str,
    ) -> Result<SignalThread, ServerError> {
        let (thread, ()) = self
            .mutate(caller, thread_id, |t, now| apply_promote_admin(t, caller.phone(), target, now))
            .await?;
        self.notify_group(&thread, GroupChange::AdminPromoted, caller, vec![target.to_string()]);
        Ok(thread)
    }

    pub async fn revoke_admin(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        target: &str,
    ) -> Result<SignalThread, ServerError> {
        let (thread, ()) = self
            .mutate(caller, thread_id, |t, now| apply_revoke_admin(t, caller.phone(), target, now))
            .await?;
        self.notify_group(&thread, GroupChange::AdminRevoked, caller, vec![target.to_string()]);
        Ok(thread)
    }

    /// Soft-delete `msg_ids`, all of which must belong to `thread_id`.
    pub fn delete_messages(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        msg_ids: &[String],
        delete_for_all: bool,
    ) -> Result<DeleteOutcome, ServerError> {
        if msg_ids.is_empty() {
            return Err(ServerError::InvalidArgument("no message ids".into()));
        }
        let thread = self.load(thread_id)?;
        require_participant(&thread, caller.phone())?;

        let found = self.store.call(|db| db.get_messages_by_ids(msg_ids))?;
        if let Some(stray) = msg_ids
            .iter()
            .find(|id| !found.iter().any(|m| &m.msg_id == *id && &m.thread_id == thread_id))
        {
            return Err(ServerError::InvalidArgument(format!(
                "message {stray} does not belong to {thread_id}"
            )));
        }

        let (users, for_all) = delete_scope(&thread, caller.phone(), delete_for_all);
        self.store
            .call(|db| db.append_delete_users_by_msg_ids(msg_ids, &users))?;

        self.notify_event(
            &thread,
            caller,
            SystemEvent::MessagesDeleted {
                thread_id: thread_id.clone(),
                msg_ids: msg_ids.to_vec(),
                delete_for_all: for_all,
            },
        );
        Ok(DeleteOutcome {
            count: found.len(),
            delete_for_all: for_all,
        })
    }

    pub fn clear_thread(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        delete_for_all: bool,
    ) -> Result<DeleteOutcome, ServerError> {
        let thread = self.load(thread_id)?;
        require_participant(&thread, caller.phone())?;

        let (users, for_all) = delete_scope(&thread, caller.phone(), delete_for_all);
        let count = self
            .store
            .call(|db| db.append_delete_users_by_thread(thread_id, &users))?;

        self.notify_event(
            &thread,
            caller,
            SystemEvent::ThreadCleared {
                thread_id: thread_id.clone(),
                delete_for_all: for_all,
            },
        );
        Ok(DeleteOutcome {
            count,
            delete_for_all: for_all,
        })
    }

    pub fn delete_solo_thread(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        delete_for_all: bool,
    ) -> Result<DeleteOutcome, ServerError> {
        let thread = self.load(thread_id)?;
        if thread.kind != ThreadKind::Solo {
            return Err(ServerError::InvalidArgument(format!(
                "{thread_id} is not a solo thread"
            )));
        }
        require_participant(&thread, caller.phone())?;

        let (users, for_all) = delete_scope(&thread, caller.phone(), delete_for_all);
        let count = self
            .store
            .call(|db| db.append_delete_users_by_thread(thread_id, &users))?;

        self.notify_event(
            &thread,
            caller,
            SystemEvent::ThreadDeleted {
                thread_id: thread_id.clone(),
                delete_for_all: for_all,
            },
        );
        Ok(DeleteOutcome {
            count,
            delete_for_all: for_all,
        })
    }
}

//! Builders for envelopes the server authors: contact-update notices,
//! delete/clear notices and group membership notifications.
//!
//! These go through the same ingest and fan-out path as client messages.

use uuid::Uuid;

use courier_shared::protocol::{
    encode_body, ContactProfile, Envelope, EnvelopeHeader, GroupChange, GroupNotification,
    MessageKind, RequestMethod, SignalMessage, SystemEvent,
};
use courier_shared::types::{now_millis, ThreadId, ThreadKind};
use courier_store::{SignalThread, User};

use crate::error::ServerError;

fn stamped(message: &mut SignalMessage) {
    message.server_date = message.msg_date;
}

fn header_from(user: &User, session_id: &str, to: &str) -> EnvelopeHeader {
    EnvelopeHeader {
        method: Some(RequestMethod::Message),
        from: user.phone_full.clone(),
        from_session: session_id.to_string(),
        from_username: user.username.clone().unwrap_or_default(),
        from_first_name: user.first_name.clone(),
        from_last_name: user.last_name.clone(),
        to: to.to_string(),
        to_sessions_whitelist: Vec::new(),
    }
}

/// Recipient field for a thread-scoped notice: the thread id for groups,
/// the other party for SOLO threads.
fn thread_recipient(thread: &SignalThread, sender: &str) -> String {
    match thread.kind {
        ThreadKind::Group => thread.thread_id.to_string(),
        ThreadKind::Solo => thread
            .counterpart(sender)
            .unwrap_or(sender)
            .to_string(),
    }
}

/// Tell `receiver` (only on `sessions`) that a contact changed their profile.
pub fn contact_updated(
    receiver: &str,
    sessions: Vec<String>,
    profile: ContactProfile,
) -> Result<Envelope, ServerError> {
    let data = encode_body(&SystemEvent::ContactUpdated(profile))?;
    let thread_id = ThreadId::solo(courier_shared::constants::SERVER_EVENT_SENDER, receiver);
    let mut message = SignalMessage::new(
        thread_id,
        Uuid::new_v4().to_string(),
        ThreadKind::Solo,
        MessageKind::Event,
        now_millis(),
        data,
    );
    stamped(&mut message);

    let mut envelope = Envelope::system(receiver, &message)?;
    envelope.header.to_sessions_whitelist = sessions;
    Ok(envelope)
}

/// A delete/clear notice authored by `actor` in `thread`.
pub fn thread_event(
    thread: &SignalThread,
    actor: &User,
    actor_session: &str,
    event: SystemEvent,
) -> Result<Envelope, ServerError> {
    let data = encode_body(&event)?;
    let mut message = SignalMessage::new(
        thread.thread_id.clone(),
        Uuid::new_v4().to_string(),
        thread.kind,
        MessageKind::Event,
        now_millis(),
        data,
    );
    stamped(&mut message);

    let to = thread_recipient(thread, &actor.phone_full);
    Ok(Envelope::new(header_from(actor, actor_session, &to), &message)?)
}

/// A membership/admin change notification for a group thread, carrying the
/// thread's state after the change.
pub fn group_notification(
    thread: &SignalThread,
    change: GroupChange,
    executor: &User,
    executor_session: &str,
    target_members: Vec<String>,
) -> Result<Envelope, ServerError> {
    let body = GroupNotification {
        change,
        thread_id: thread.thread_id.clone(),
        executor: executor.phone_full.clone(),
        target_members,
        group_name: thread.group_name.clone(),
        creator: thread.creator.clone(),
        participants: thread.participants.clone(),
        last_modified: thread.last_modified,
    };
    let mut message = SignalMessage::new(
        thread.thread_id.clone(),
        Uuid::new_v4().to_string(),
        ThreadKind::Group,
        MessageKind::GroupNotification,
        now_millis(),
        encode_body(&body)?,
    );
    stamped(&mut message);

    let header = header_from(executor, executor_session, thread.thread_id.as_str());
    Ok(Envelope::new(header, &message)?)
}

#[cfg(test)]
mod tests {
    use courier_shared::constants::SERVER_EVENT_SENDER;
    use courier_shared::protocol::decode_body;

    use super::*;

    fn user(phone: &str) -> User {
        User {
            phone_full: phone.into(),
            phone: phone.into(),
            country_code: "1".into(),
            username: Some(format!("{phone}-name")),
            first_name: "First".into(),
            last_name: "Last".into(),
            avatar: None,
            sessions: Vec::new(),
            group_threads: Default::default(),
            created_at: 0,
        }
    }

    #[test]
    fn contact_update_targets_receiver_sessions() {
        let profile = ContactProfile {
            phone_full: "alice".into(),
            username: None,
            first_name: "Alice".into(),
            last_name: String::new(),
            avatar: None,
        };
        let env = contact_updated("bob", vec!["b1".into()], profile.clone()).unwrap();
        let msg = env.message().unwrap();

        assert_eq!(env.header.from, SERVER_EVENT_SENDER);
        assert_eq!(env.header.to, "bob");
        assert_eq!(env.header.to_sessions_whitelist, vec!["b1".to_string()]);
        assert_eq!(msg.thread_id, ThreadId::solo(SERVER_EVENT_SENDER, "bob"));
        assert!(msg.checksum_valid());
        assert_eq!(
            decode_body::<SystemEvent>(&msg.data).unwrap(),
            SystemEvent::ContactUpdated(profile)
        );
    }

    #[test]
    fn solo_delete_notice_goes_to_counterpart() {
        let thread = SignalThread::solo("alice", "bob", 0);
        let event = SystemEvent::MessagesDeleted {
            thread_id: thread.thread_id.clone(),
            msg_ids: vec!["m1".into()],
            delete_for_all: true,
        };
        let env = thread_event(&thread, &user("alice"), "a1", event).unwrap();

        assert_eq!(env.header.from, "alice");
        assert_eq!(env.header.from_session, "a1");
        assert_eq!(env.header.to, "bob");
        assert_eq!(env.message().unwrap().kind, MessageKind::Event);
    }

    #[test]
    fn group_notification_carries_post_change_state() {
        let mut thread = SignalThread::solo("alice", "bob", 0);
        thread.thread_id = ThreadId::from("g-1");
        thread.kind = ThreadKind::Group;
        thread.participants.push("carol".into());

        let env = group_notification(
            &thread,
            GroupChange::MembersAdded,
            &user("alice"),
            "a1",
            vec!["carol".into()],
        )
        .unwrap();
        let msg = env.message().unwrap();
        let body: GroupNotification = decode_body(&msg.data).unwrap();

        assert_eq!(env.header.to, "g-1");
        assert_eq!(msg.kind, MessageKind::GroupNotification);
        assert_eq!(body.participants.len(), 3);
        assert_eq!(body.target_members, vec!["carol".to_string()]);
    }
}

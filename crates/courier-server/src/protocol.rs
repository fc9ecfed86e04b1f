//! Envelope verification and ingestion.
//!
//! `verify` checks an envelope against the authenticated caller and rejects
//! it before anything is written. `ingest` resolves (or creates) the owning
//! thread, stamps the server time and persists the message idempotently.

use std::collections::BTreeSet;

use futures::FutureExt;
use tracing::{debug, info, warn};

use courier_shared::constants::MAX_MESSAGE_SIZE;
use courier_shared::protocol::{
    decode_body, Envelope, MessageKind, RequestMethod, SeenState, SeenStateBody, SignalMessage,
};
use courier_shared::types::{now_millis, ThreadId, ThreadKind};
use courier_shared::ProtocolError;
use courier_store::{SignalMsg, SignalThread, User};

use crate::error::ServerError;
use crate::store::Store;
use crate::tasks::TaskQueue;

/// Result of a successful ingest.
#[derive(Debug, Clone)]
pub struct Ingested {
    /// The envelope as persisted, with the server time stamped in.
    pub envelope: Envelope,
    pub thread: SignalThread,
    pub server_date: i64,
    /// `false` for ephemeral kinds, which are relayed but not stored.
    pub persisted: bool,
    /// `true` when `msg_id` was already stored. The replay is acknowledged
    /// but must not be fanned out again.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct SignalProtocol {
    store: Store,
    tasks: TaskQueue,
}

impl SignalProtocol {
    pub fn new(store: Store, tasks: TaskQueue) -> Self {
        Self { store, tasks }
    }

    /// Check a client envelope against the authenticated `(caller, session)`.
    pub fn verify(
        &self,
        envelope: &Envelope,
        caller: &str,
        session_id: &str,
    ) -> Result<SignalMessage, ServerError> {
        let header = &envelope.header;
        if header.method != Some(RequestMethod::Message) {
            return Err(ProtocolError::ProtocolMismatch.into());
        }
        if header.from != caller || header.from_session != session_id {
            return Err(ProtocolError::IdentityMismatch.into());
        }

        let message = envelope.message()?;
        if message.data.len() > MAX_MESSAGE_SIZE {
            return Err(ServerError::InvalidArgument(format!(
                "payload of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                message.data.len()
            )));
        }
        if !message.checksum_valid() {
            return Err(ProtocolError::ChecksumMismatch.into());
        }

        if message.thread_kind == ThreadKind::Group {
            let thread = self
                .store
                .call(|db| db.find_thread(&message.thread_id))?
                .ok_or_else(|| ProtocolError::UnknownThread(message.thread_id.to_string()))?;
            if !thread.is_participant(caller) {
                return Err(ProtocolError::NotAMember(thread.thread_id.to_string()).into());
            }
        }

        Ok(message)
    }

    /// Resolve the thread, stamp the server time and persist the message.
    ///
    /// `sender` supplies the display fields copied into the header; system
    /// envelopes pass `None`.
    pub fn ingest(&self, mut envelope: Envelope, sender: Option<&User>) -> Result<Ingested, ServerError> {
        let mut message = envelope.message()?;
        let now = now_millis();

        let thread = self.resolve_thread(&envelope, &message, now)?;

        if let Some(user) = sender {
            envelope.header.from_username = user.username.clone().unwrap_or_default();
            envelope.header.from_first_name = user.first_name.clone();
            envelope.header.from_last_name = user.last_name.clone();
        }

        if message.kind.is_ephemeral() {
            debug!(thread_id = %thread.thread_id, kind = ?message.kind, "Relaying ephemeral message");
            return Ok(Ingested {
                envelope,
                thread,
                server_date: now,
                persisted: false,
                replayed: false,
            });
        }

        message.server_date = now;
        envelope.content = message.to_bytes()?;

        let received_sessions: BTreeSet<String> = Some(envelope.header.from_session.clone())
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();

        let record = SignalMsg {
            msg_id: message.msg_id.clone(),
            thread_id: thread.thread_id.clone(),
            thread_kind: thread.kind,
            from: envelope.header.from.clone(),
            to: envelope.header.to.clone(),
            to_sessions_whitelist: envelope.header.to_sessions_whitelist.clone(),
            received_sessions,
            seen_by_users: BTreeSet::new(),
            delete_for_users: BTreeSet::new(),
            payload: envelope.to_bytes()?,
            created_at: now,
        };
        let inserted = self.store.call(|db| db.insert_message(&record))?;
        if !inserted {
            debug!(msg_id = %record.msg_id, "Message already stored, replay ignored");
        } else if message.kind == MessageKind::SeenState {
            self.record_seen(&message, &envelope.header.from);
        }

        Ok(Ingested {
            envelope,
            thread,
            server_date: now,
            persisted: inserted,
            replayed: !inserted,
        })
    }

    fn resolve_thread(
        &self,
        envelope: &Envelope,
        message: &SignalMessage,
        now: i64,
    ) -> Result<SignalThread, ServerError> {
        match message.thread_kind {
            ThreadKind::Solo => {
                let header = &envelope.header;
                let computed = ThreadId::solo(&header.from, &header.to);
                if message.thread_id != computed {
                    return Err(ProtocolError::ThreadIdMismatch {
                        embedded: message.thread_id.to_string(),
                        computed: computed.to_string(),
                    }
                    .into());
                }

                let candidate = SignalThread::solo(&header.from, &header.to, now);
                if message.kind.is_ephemeral() {
                    let existing = self.store.call(|db| db.find_thread(&computed))?;
                    return Ok(existing.unwrap_or(candidate));
                }
                let (thread, created) = self.store.call(|db| db.insert_thread_if_absent(&candidate))?;
                if created {
                    info!(thread_id = %thread.thread_id.short(), "Created solo thread");
                }
                Ok(thread)
            }
            ThreadKind::Group => {
                if envelope.header.to != message.thread_id.as_str() {
                    return Err(ProtocolError::RecipientMismatch {
                        to: envelope.header.to.clone(),
                        thread_id: message.thread_id.to_string(),
                    }
                    .into());
                }
                self.store
                    .call(|db| db.find_thread(&message.thread_id))?
                    .ok_or_else(|| ProtocolError::UnknownThread(message.thread_id.to_string()).into())
            }
        }
    }

    // Seen receipts update `seenByUsers` off the request path.
    fn record_seen(&self, message: &SignalMessage, phone_full: &str) {
        let body: SeenStateBody = match decode_body(&message.data) {
            Ok(body) => body,
            Err(e) => {
                warn!(msg_id = %message.msg_id, error = %e, "Undecodable seen-state body");
                return;
            }
        };
        if body.state != SeenState::Seen || body.msg_ids.is_empty() {
            return;
        }

        let store = self.store.clone();
        let phone_full = phone_full.to_string();
        self.tasks.submit(
            "seen-state",
            async move {
                match store.call(|db| db.append_seen_by_user(&body.msg_ids, &phone_full)) {
                    Ok(n) => debug!(user = %phone_full, updated = n, "Recorded seen state"),
                    Err(e) => warn!(user = %phone_full, error = %e, "Failed to record seen state"),
                }
            }
            .boxed(),
        );
    }
}

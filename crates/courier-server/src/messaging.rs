//! Send, acknowledge and fetch signal messages.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use courier_shared::constants::{INITIAL_SYNC_PER_THREAD, MAX_OLD_MESSAGES, UNRECEIVED_PAGE_SIZE};
use courier_shared::protocol::{Envelope, EnvelopeResponse};
use courier_shared::types::{now_millis, ThreadId};
use courier_store::{SignalMsg, SignalThread, UnreceivedQuery};

use crate::auth::Caller;
use crate::error::ServerError;
use crate::fanout::Broadcaster;
use crate::protocol::SignalProtocol;
use crate::store::Store;

/// One page of undelivered envelopes, base64-encoded.
#[derive(Debug, Clone, Serialize)]
pub struct UnreceivedPage {
    pub page: u32,
    pub total: u64,
    pub has_more: bool,
    pub envelopes: Vec<String>,
}

/// A thread with its newest undelivered envelopes in chronological order.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSync {
    pub thread: SignalThread,
    pub envelopes: Vec<String>,
}

/// `0` or anything over the maximum asks for the maximum.
pub fn clamp_old_limit(limit: u32) -> u32 {
    if limit == 0 || limit > MAX_OLD_MESSAGES {
        MAX_OLD_MESSAGES
    } else {
        limit
    }
}

/// Re-encode a stored envelope with `seen_by` filled from the store.
/// Rows that no longer decode are skipped.
fn hydrate(record: &SignalMsg) -> Option<String> {
    let encoded = Envelope::from_bytes(&record.payload).and_then(|mut envelope| {
        let mut message = envelope.message()?;
        message.seen_by = record.seen_by_users.iter().cloned().collect();
        envelope.content = message.to_bytes()?;
        envelope.to_base64()
    });
    match encoded {
        Ok(encoded) => Some(encoded),
        Err(e) => {
            warn!(msg_id = %record.msg_id, error = %e, "Skipping undecodable stored message");
            None
        }
    }
}

#[derive(Clone)]
pub struct Messaging {
    store: Store,
    protocol: SignalProtocol,
    broadcaster: Broadcaster,
    backfill_window: Duration,
}

impl Messaging {
    pub fn new(
        store: Store,
        protocol: SignalProtocol,
        broadcaster: Broadcaster,
        backfill_window: Duration,
    ) -> Self {
        Self {
            store,
            protocol,
            broadcaster,
            backfill_window,
        }
    }

    /// Verify, persist and queue fan-out for a client envelope.
    pub async fn send(&self, caller: &Caller, envelope: Envelope) -> Result<EnvelopeResponse, ServerError> {
        self.protocol.verify(&envelope, caller.phone(), &caller.session_id)?;

        let header = envelope.header.clone();
        let ingested = self.protocol.ingest(envelope, Some(&caller.user))?;
        debug!(
            from = caller.phone(),
            thread_id = %ingested.thread.thread_id.short(),
            persisted = ingested.persisted,
            replayed = ingested.replayed,
            "Signal message accepted"
        );

        if !ingested.replayed {
            self.broadcaster
                .submit(ingested.thread, ingested.envelope)
                .await;
        }
        Ok(EnvelopeResponse::accepted(header, ingested.server_date))
    }

    /// Mark `msg_ids` as received by the caller's session.
    pub fn confirm_received(&self, caller: &Caller, msg_ids: &[String]) -> Result<usize, ServerError> {
        let ids: Vec<String> = msg_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let added = self
            .store
            .call(|db| db.append_received_session_by_msg_ids(&ids, &caller.session_id))?;
        debug!(user = caller.phone(), session = %caller.session_id, added, "Confirmed received");
        Ok(added)
    }

    /// One page of messages the caller's session has not acknowledged.
    ///
    /// `from_date` defaults to the start of the backfill window; `to_date`
    /// of zero is unbounded.
    pub fn fetch_unreceived(
        &self,
        caller: &Caller,
        from_date: Option<i64>,
        to_date: Option<i64>,
        page: u32,
    ) -> Result<UnreceivedPage, ServerError> {
        let window_ms = i64::try_from(self.backfill_window.as_millis()).unwrap_or(i64::MAX);
        let query = UnreceivedQuery {
            phone_full: caller.phone(),
            session_id: &caller.session_id,
            from_date: from_date.unwrap_or_else(|| now_millis().saturating_sub(window_ms)),
            to_date: to_date.unwrap_or(0),
        };

        let (total, records) = self.store.call(|db| {
            let total = db.count_unreceived(&query)?;
            let records = db.find_unreceived(&query, page, UNRECEIVED_PAGE_SIZE)?;
            Ok((total, records))
        })?;

        let fetched = u64::from(page).saturating_add(1) * u64::from(UNRECEIVED_PAGE_SIZE);
        Ok(UnreceivedPage {
            page,
            total,
            has_more: fetched < total,
            envelopes: records.iter().filter_map(hydrate).collect(),
        })
    }

    /// Newest undelivered messages of every thread the caller is in.
    pub fn initial_sync(&self, caller: &Caller) -> Result<Vec<ThreadSync>, ServerError> {
        let threads = self.store.call(|db| db.find_threads_of_user(caller.phone()))?;

        let mut synced = Vec::with_capacity(threads.len());
        for thread in threads {
            let mut records = self.store.call(|db| {
                db.find_unreceived_of_thread(
                    &thread.thread_id,
                    caller.phone(),
                    &caller.session_id,
                    0,
                    0,
                    true,
                    INITIAL_SYNC_PER_THREAD,
                )
            })?;
            records.reverse();
            synced.push(ThreadSync {
                envelopes: records.iter().filter_map(hydrate).collect(),
                thread,
            });
        }

        info!(user = caller.phone(), threads = synced.len(), "Initial sync");
        Ok(synced)
    }

    /// Messages of `thread_id` older than `before`, newest first.
    pub fn fetch_old(
        &self,
        caller: &Caller,
        thread_id: &ThreadId,
        before: i64,
        limit: u32,
    ) -> Result<Vec<String>, ServerError> {
        let thread = self
            .store
            .call(|db| db.find_thread(thread_id))?
            .ok_or_else(|| ServerError::NotFound(format!("thread {thread_id}")))?;
        if !thread.is_participant(caller.phone()) {
            return Err(ServerError::PermissionDenied(format!(
                "{} is not a participant of {thread_id}",
                caller.phone()
            )));
        }

        let records = self.store.call(|db| {
            db.find_old_messages(thread_id, caller.phone(), before, clamp_old_limit(limit))
        })?;
        Ok(records.iter().filter_map(hydrate).collect())
    }
}

//! Real-time fan-out.
//!
//! Ingested envelopes are queued on a [`Broadcaster`]; one [`BroadcastWorker`]
//! publishes them to every connected socket of each target and hands the
//! offline remainder to push dispatch. Nothing here reports back to the
//! sender: durability is established by ingest, delivery by the recipient's
//! own acknowledgement.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use courier_shared::constants::EVENT_CHAT_MESSAGE;
use courier_shared::protocol::{Envelope, PushTier};
use courier_shared::types::{DeviceKind, ThreadKind};
use courier_store::SignalThread;

use crate::push::{PushBatch, PushDispatcher};
use crate::registry::{SessionRegistry, SocketFrame};
use crate::store::Store;

/// One envelope to deliver within its resolved thread.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub thread: SignalThread,
    pub envelope: Envelope,
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Delivery>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Store,
        push: PushDispatcher,
        capacity: usize,
    ) -> (Self, BroadcastWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self { tx },
            BroadcastWorker {
                rx,
                registry,
                store,
                push,
            },
        )
    }

    /// Queue a delivery. Waits for queue space but never for socket or
    /// gateway I/O.
    pub async fn submit(&self, thread: SignalThread, envelope: Envelope) {
        if self.tx.send(Delivery { thread, envelope }).await.is_err() {
            error!("Broadcast queue closed, dropping delivery");
        }
    }
}

/// Identities a message is published to, in publish order.
///
/// SOLO threads reach the sender (for their other devices) and the
/// recipient. GROUP threads reach every current participant except the
/// sender.
pub fn broadcast_targets(thread: &SignalThread, from: &str, to: &str) -> Vec<String> {
    match thread.kind {
        ThreadKind::Solo => {
            let mut targets = vec![from.to_string()];
            if to != from {
                targets.push(to.to_string());
            }
            targets
        }
        ThreadKind::Group => thread
            .participants
            .iter()
            .filter(|p| p.as_str() != from)
            .cloned()
            .collect(),
    }
}

pub struct BroadcastWorker {
    rx: mpsc::Receiver<Delivery>,
    registry: Arc<SessionRegistry>,
    store: Store,
    push: PushDispatcher,
}

impl BroadcastWorker {
    pub async fn run(mut self) {
        while let Some(delivery) = self.rx.recv().await {
            self.fan_out(&delivery).await;
        }
        debug!("Broadcast queue closed, worker exiting");
    }

    /// Publish `delivery` to connected sockets and queue wake-up pushes for
    /// every offline target session except the one that sent it. Returns the
    /// number of sockets reached.
    pub async fn fan_out(&self, delivery: &Delivery) -> usize {
        let header = &delivery.envelope.header;
        let message = match delivery.envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(thread_id = %delivery.thread.thread_id, error = %e, "Undecodable envelope in fan-out");
                return 0;
            }
        };
        let payload = match delivery.envelope.to_base64() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(msg_id = %message.msg_id, error = %e, "Failed to encode envelope for fan-out");
                return 0;
            }
        };

        let tier = message.kind.push_tier();
        let frame = SocketFrame::new(EVENT_CHAT_MESSAGE, payload.clone());
        let mut reached = 0;
        let mut offline: BTreeMap<DeviceKind, Vec<String>> = BTreeMap::new();

        for target in broadcast_targets(&delivery.thread, &header.from, &header.to) {
            reached += self.registry.publish(&target, &frame).await;

            if tier.is_none() {
                continue;
            }
            let whitelist = if target == header.to {
                header.to_sessions_whitelist.as_slice()
            } else {
                &[]
            };
            let origin = (target == header.from).then_some(header.from_session.as_str());
            for (platform, token) in self.offline_tokens(&target, whitelist, origin).await {
                offline.entry(platform).or_default().push(token);
            }
        }

        debug!(
            msg_id = %message.msg_id,
            thread_id = %delivery.thread.thread_id.short(),
            sockets = reached,
            "Fan-out published"
        );

        if let Some(tier) = tier {
            self.dispatch_push(offline, &payload, tier);
        }
        reached
    }

    /// Push tokens of `phone_full`'s sessions that have no connected socket.
    /// A non-empty `whitelist` further restricts the sessions considered and
    /// `origin` is the sending session, never woken for its own message.
    async fn offline_tokens(
        &self,
        phone_full: &str,
        whitelist: &[String],
        origin: Option<&str>,
    ) -> Vec<(DeviceKind, String)> {
        let connected: HashSet<String> = self
            .registry
            .sockets_of(phone_full)
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();

        let sessions = match self.store.call(|db| db.get_sessions(phone_full)) {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(user = phone_full, error = %e, "Offline session lookup failed");
                return Vec::new();
            }
        };

        sessions
            .iter()
            .filter(|s| !connected.contains(&s.session_id))
            .filter(|s| origin != Some(s.session_id.as_str()))
            .filter(|s| whitelist.is_empty() || whitelist.contains(&s.session_id))
            .filter_map(|s| s.push_token().map(|t| (s.device_kind, t.to_string())))
            .collect()
    }

    fn dispatch_push(&self, offline: BTreeMap<DeviceKind, Vec<String>>, payload: &str, tier: PushTier) {
        for (platform, tokens) in offline {
            let count = tokens.len();
            if self.push.submit(PushBatch {
                platform,
                tokens,
                payload: payload.to_string(),
                tier,
            }) {
                debug!(platform = platform.as_str(), tokens = count, tier = tier.as_str(), "Queued wake-up push");
            }
        }
    }
}

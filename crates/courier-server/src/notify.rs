//! Fire-and-forget delivery of server-authored envelopes.
//!
//! A notice is ingested and broadcast on the side-effect queue, after the
//! mutation that caused it has already committed. Failures are logged and
//! never roll anything back.

use futures::FutureExt;
use tracing::{debug, warn};

use courier_shared::protocol::Envelope;

use crate::fanout::Broadcaster;
use crate::protocol::SignalProtocol;
use crate::tasks::TaskQueue;

#[derive(Clone)]
pub struct Notifier {
    protocol: SignalProtocol,
    broadcaster: Broadcaster,
    tasks: TaskQueue,
}

impl Notifier {
    pub fn new(protocol: SignalProtocol, broadcaster: Broadcaster, tasks: TaskQueue) -> Self {
        Self {
            protocol,
            broadcaster,
            tasks,
        }
    }

    /// Queue `envelope` for ingest and fan-out. Returns `false` if the
    /// side-effect queue rejected it.
    pub fn emit(&self, label: &'static str, envelope: Envelope) -> bool {
        let protocol = self.protocol.clone();
        let broadcaster = self.broadcaster.clone();

        self.tasks.submit(
            label,
            async move {
                match protocol.ingest(envelope, None) {
                    Ok(ingested) if ingested.replayed => {
                        debug!(notice = label, "Notice already stored, not re-sent");
                    }
                    Ok(ingested) => {
                        debug!(notice = label, thread_id = %ingested.thread.thread_id.short(), "Notice ingested");
                        broadcaster.submit(ingested.thread, ingested.envelope).await;
                    }
                    Err(e) => warn!(notice = label, error = %e, "Failed to ingest notice"),
                }
            }
            .boxed(),
        )
    }

    /// Emit the envelope produced by `build`, logging a build failure.
    pub fn emit_with<E: std::fmt::Display>(
        &self,
        label: &'static str,
        build: impl FnOnce() -> Result<Envelope, E>,
    ) {
        match build() {
            Ok(envelope) => {
                self.emit(label, envelope);
            }
            Err(e) => warn!(notice = label, error = %e, "Failed to build notice"),
        }
    }
}

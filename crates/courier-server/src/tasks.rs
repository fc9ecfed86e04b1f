//! Bounded queue for fire-and-forget side effects.
//!
//! Seen-state appends and change notifications are submitted here instead of
//! being spawned ad hoc. One worker drains the queue in submission order; a
//! full queue drops the task and logs it.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Task {
    label: &'static str,
    work: BoxFuture<'static, ()>,
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
}

pub struct TaskWorker {
    rx: mpsc::Receiver<Task>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> (Self, TaskWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, TaskWorker { rx })
    }

    /// Queue `work`. Returns `false` when the queue is full or closed.
    pub fn submit(&self, label: &'static str, work: BoxFuture<'static, ()>) -> bool {
        match self.tx.try_send(Task { label, work }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(task = task.label, "Side-effect queue full, dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!(task = task.label, "Side-effect queue closed, dropping task");
                false
            }
        }
    }
}

impl TaskWorker {
    /// Drain the queue until every [`TaskQueue`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            debug!(task = task.label, "Running side effect");
            task.work.await;
        }
        debug!("Side-effect queue closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let (queue, worker) = TaskQueue::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let seen = seen.clone();
            assert!(queue.submit("push", async move { seen.lock().unwrap().push(i) }.boxed()));
        }
        drop(queue);
        worker.run().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (queue, _worker) = TaskQueue::new(1);
        assert!(queue.submit("first", async {}.boxed()));
        assert!(!queue.submit("second", async {}.boxed()));
    }
}

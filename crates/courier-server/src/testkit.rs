//! In-process server fixture for service tests.

use std::sync::Arc;
use std::time::Duration;

use courier_shared::protocol::PushTier;
use courier_shared::types::DeviceKind;
use courier_store::{User, UserSession};
use tempfile::TempDir;

use crate::api::{AppState, Workers};
use crate::auth::Caller;
use crate::config::ServerConfig;
use crate::push::tests::RecordingGateway;
use crate::store::Store;

pub(crate) struct TestServer {
    pub state: AppState,
    workers: Workers,
    gateway: Arc<RecordingGateway>,
    _dir: TempDir,
}

/// What is left after every queue has been drained.
pub(crate) struct Drained {
    pub store: Store,
    pub push_calls: Vec<(DeviceKind, Vec<String>, PushTier)>,
    _dir: TempDir,
}

impl TestServer {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(&dir.path().join("courier.db"))).unwrap();
        let config = ServerConfig {
            task_queue_capacity: 1024,
            broadcast_queue_capacity: 1024,
            push_queue_capacity: 1024,
            lock_retry_delay: Duration::from_millis(5),
            rate_limit_burst: 1000.0,
            ..ServerConfig::default()
        };
        let gateway = Arc::new(RecordingGateway::default());
        let (state, workers) = AppState::new(config, store, gateway.clone());
        Self {
            state,
            workers,
            gateway,
            _dir: dir,
        }
    }

    pub fn store(&self) -> &Store {
        &self.state.store
    }

    pub fn seed_user(&self, phone: &str, sessions: &[&str]) {
        let sessions: Vec<(&str, DeviceKind)> =
            sessions.iter().map(|s| (*s, DeviceKind::Android)).collect();
        self.seed_user_with(phone, &sessions);
    }

    pub fn seed_user_with(&self, phone: &str, sessions: &[(&str, DeviceKind)]) {
        let user = User {
            phone_full: phone.into(),
            phone: phone.into(),
            country_code: "1".into(),
            username: Some(format!("{phone}_name")),
            first_name: phone.to_uppercase(),
            last_name: "Tester".into(),
            avatar: None,
            sessions: sessions
                .iter()
                .map(|(id, kind)| UserSession::new(*id, *kind))
                .collect(),
            group_threads: Default::default(),
            created_at: 0,
        };
        self.store().call(|db| db.insert_user(&user)).unwrap();
    }

    /// Close every queue and run the workers to completion in dependency
    /// order: side effects feed the broadcaster, which feeds push.
    pub async fn drain(self) -> Drained {
        let TestServer {
            state,
            workers,
            gateway,
            _dir,
        } = self;
        let store = state.store.clone();
        drop(state);

        workers.tasks.run().await;
        workers.broadcast.run().await;
        workers.push.run().await;

        let push_calls = gateway.calls.lock().unwrap().clone();
        Drained {
            store,
            push_calls,
            _dir,
        }
    }
}

pub(crate) fn caller(state: &AppState, phone: &str, session: &str) -> Caller {
    Caller::resolve(&state.store, phone, session, Duration::from_secs(5)).unwrap()
}

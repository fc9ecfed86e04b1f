use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{Method, StatusCode},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::constants::MAX_MESSAGE_SIZE;
use courier_shared::protocol::{ContactProfile, Envelope};
use courier_shared::types::{PushService, ThreadId};
use courier_store::SignalThread;

use crate::auth::Caller;
use crate::config::ServerConfig;
use crate::contacts::{ContactBook, ContactEntry, SyncReport};
use crate::error::ServerError;
use crate::fanout::{BroadcastWorker, Broadcaster};
use crate::lock::LeaseLocker;
use crate::messaging::{Messaging, ThreadSync, UnreceivedPage};
use crate::notify::Notifier;
use crate::protocol::SignalProtocol;
use crate::push::{PushDispatcher, PushGateway, PushWorker};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::SessionRegistry;
use crate::store::Store;
use crate::tasks::{TaskQueue, TaskWorker};
use crate::threads::{DeleteOutcome, ThreadInfo, ThreadService};
use crate::users::{ProfileService, ProfileView};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Store,
    pub registry: Arc<SessionRegistry>,
    pub messaging: Messaging,
    pub threads: ThreadService,
    pub users: ProfileService,
    pub contacts: ContactBook,
    pub rate_limiter: RateLimiter,
}

/// Background consumers of the queues owned by [`AppState`]. Each one runs
/// until every sender handle is dropped.
pub struct Workers {
    pub tasks: TaskWorker,
    pub broadcast: BroadcastWorker,
    pub push: PushWorker,
}

impl Workers {
    pub fn spawn(self) {
        tokio::spawn(self.tasks.run());
        tokio::spawn(self.broadcast.run());
        tokio::spawn(self.push.run());
    }
}

impl AppState {
    pub fn new(config: ServerConfig, store: Store, gateway: Arc<dyn PushGateway>) -> (Self, Workers) {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(store.clone()));

        let (tasks, task_worker) = TaskQueue::new(config.task_queue_capacity);
        let (push, push_worker) =
            PushDispatcher::new(gateway, config.push_queue_capacity, config.push_batch_limit);
        let (broadcaster, broadcast_worker) = Broadcaster::new(
            registry.clone(),
            store.clone(),
            push,
            config.broadcast_queue_capacity,
        );

        let locker = LeaseLocker::new(
            store.clone(),
            config.lock_ttl,
            config.lock_retry_delay,
            config.lock_max_attempts,
        );
        let protocol = SignalProtocol::new(store.clone(), tasks.clone());
        let notifier = Notifier::new(protocol.clone(), broadcaster.clone(), tasks);

        let backfill_days = u64::try_from(config.backfill_window_days.max(0)).unwrap_or(0);
        let messaging = Messaging::new(
            store.clone(),
            protocol,
            broadcaster,
            Duration::from_secs(backfill_days * 24 * 60 * 60),
        );

        let state = Self {
            threads: ThreadService::new(store.clone(), locker.clone(), notifier.clone()),
            users: ProfileService::new(store.clone(), notifier),
            contacts: ContactBook::new(store.clone(), locker),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            messaging,
            registry,
            store,
            config,
        };
        let workers = Workers {
            tasks: task_worker,
            broadcast: broadcast_worker,
            push: push_worker,
        };
        (state, workers)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/ws", get(ws::handle_websocket))
        .route("/v1/messages", post(send_message))
        .route("/v1/messages/confirm", post(confirm_received))
        .route("/v1/messages/unreceived", get(fetch_unreceived))
        .route("/v1/sync", get(initial_sync))
        .route("/v1/threads/:id", get(thread_info))
        .route("/v1/threads/:id/messages", get(fetch_old))
        .route("/v1/threads/:id/messages/delete", post(delete_messages))
        .route("/v1/threads/:id/clear", post(clear_thread))
        .route("/v1/threads/:id/delete", post(delete_solo_thread))
        .route("/v1/groups", post(create_group))
        .route("/v1/groups/:id/name", post(rename_group))
        .route("/v1/groups/:id/members/add", post(add_members))
        .route("/v1/groups/:id/members/remove", post(remove_members))
        .route("/v1/groups/:id/leave", post(leave_group))
        .route("/v1/groups/:id/delete-and-leave", post(delete_and_leave))
        .route("/v1/groups/:id/admins/promote", post(promote_admin))
        .route("/v1/groups/:id/admins/revoke", post(revoke_admin))
        .route("/v1/me/push-token", put(update_push_token))
        .route("/v1/me/profile", put(update_profile))
        .route("/v1/me/username", put(update_username))
        .route("/v1/users/search/username", get(search_by_username))
        .route("/v1/users/search/phone", get(search_by_phone_full))
        .route("/v1/users/lookup", post(find_by_list_phone_full))
        .route("/v1/contacts/sync", post(sync_contacts))
        // base64 inflates the envelope by a third
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE * 2))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.connection_count().await,
    })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SendRequest {
    /// base64 envelope
    envelope: String,
}

#[derive(Serialize)]
struct SendResponse {
    /// base64 `EnvelopeResponse`
    response: String,
    server_date: Option<i64>,
}

async fn send_message(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, ServerError> {
    let envelope = Envelope::from_base64(&req.envelope)?;
    let response = state.messaging.send(&caller, envelope).await?;
    Ok(Json(SendResponse {
        server_date: response.server_date(),
        response: response.to_base64()?,
    }))
}

#[derive(Deserialize)]
struct ConfirmRequest {
    msg_ids: Vec<String>,
}

#[derive(Serialize)]
struct ConfirmResponse {
    confirmed: usize,
}

async fn confirm_received(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ServerError> {
    let confirmed = state.messaging.confirm_received(&caller, &req.msg_ids)?;
    Ok(Json(ConfirmResponse { confirmed }))
}

#[derive(Deserialize)]
struct UnreceivedParams {
    from: Option<i64>,
    to: Option<i64>,
    #[serde(default)]
    page: u32,
}

async fn fetch_unreceived(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<UnreceivedParams>,
) -> Result<Json<UnreceivedPage>, ServerError> {
    let page = state
        .messaging
        .fetch_unreceived(&caller, params.from, params.to, params.page)?;
    Ok(Json(page))
}

async fn initial_sync(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<ThreadSync>>, ServerError> {
    Ok(Json(state.messaging.initial_sync(&caller)?))
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OldMessagesParams {
    #[serde(default)]
    before: i64,
    #[serde(default)]
    limit: u32,
}

#[derive(Serialize)]
struct EnvelopesResponse {
    envelopes: Vec<String>,
}

#[derive(Deserialize)]
struct DeleteMessagesRequest {
    msg_ids: Vec<String>,
    #[serde(default)]
    delete_for_all: bool,
}

#[derive(Deserialize, Default)]
struct DeleteScopeRequest {
    #[serde(default)]
    delete_for_all: bool,
}

async fn thread_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
) -> Result<Json<ThreadInfo>, ServerError> {
    Ok(Json(state.threads.info(&caller, &ThreadId::from(id.as_str()))?))
}

async fn fetch_old(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Query(params): Query<OldMessagesParams>,
) -> Result<Json<EnvelopesResponse>, ServerError> {
    let envelopes = state.messaging.fetch_old(
        &caller,
        &ThreadId::from(id.as_str()),
        params.before,
        params.limit,
    )?;
    Ok(Json(EnvelopesResponse { envelopes }))
}

async fn delete_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<DeleteMessagesRequest>,
) -> Result<Json<DeleteOutcome>, ServerError> {
    let outcome = state.threads.delete_messages(
        &caller,
        &ThreadId::from(id.as_str()),
        &req.msg_ids,
        req.delete_for_all,
    )?;
    Ok(Json(outcome))
}

async fn clear_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<DeleteScopeRequest>,
) -> Result<Json<DeleteOutcome>, ServerError> {
    let outcome = state
        .threads
        .clear_thread(&caller, &ThreadId::from(id.as_str()), req.delete_for_all)?;
    Ok(Json(outcome))
}

async fn delete_solo_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<DeleteScopeRequest>,
) -> Result<Json<DeleteOutcome>, ServerError> {
    let outcome = state
        .threads
        .delete_solo_thread(&caller, &ThreadId::from(id.as_str()), req.delete_for_all)?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateGroupRequest {
    group_name: String,
    participants: Vec<String>,
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

#[derive(Deserialize)]
struct MembersRequest {
    members: Vec<String>,
}

#[derive(Deserialize)]
struct AdminRequest {
    member: String,
}

async fn create_group(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<ThreadInfo>), ServerError> {
    let info = state
        .threads
        .create_group(&caller, &req.group_name, &req.participants)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn rename_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<RenameRequest>,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state
        .threads
        .rename(&caller, &ThreadId::from(id.as_str()), &req.name)
        .await?;
    Ok(Json(thread))
}

async fn add_members(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<MembersRequest>,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state
        .threads
        .add_members(&caller, &ThreadId::from(id.as_str()), &req.members)
        .await?;
    Ok(Json(thread))
}

async fn remove_members(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<MembersRequest>,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state
        .threads
        .remove_members(&caller, &ThreadId::from(id.as_str()), &req.members)
        .await?;
    Ok(Json(thread))
}

async fn leave_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state.threads.leave(&caller, &ThreadId::from(id.as_str())).await?;
    Ok(Json(thread))
}

async fn delete_and_leave(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state
        .threads
        .delete_and_leave(&caller, &ThreadId::from(id.as_str()))
        .await?;
    Ok(Json(thread))
}

async fn promote_admin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<AdminRequest>,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state
        .threads
        .promote_admin(&caller, &ThreadId::from(id.as_str()), &req.member)
        .await?;
    Ok(Json(thread))
}

async fn revoke_admin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    caller: Caller,
    Json(req): Json<AdminRequest>,
) -> Result<Json<SignalThread>, ServerError> {
    let thread = state
        .threads
        .revoke_admin(&caller, &ThreadId::from(id.as_str()), &req.member)
        .await?;
    Ok(Json(thread))
}

// ---------------------------------------------------------------------------
// Profile and contacts
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PushTokenRequest {
    service: PushService,
    token: String,
    bundle_id: Option<String>,
    app_id: Option<String>,
}

#[derive(Deserialize)]
struct ProfileRequest {
    first_name: String,
    #[serde(default)]
    last_name: String,
}

#[derive(Deserialize)]
struct UsernameRequest {
    username: String,
}

#[derive(Serialize)]
struct UsernameResponse {
    username: String,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize)]
struct LookupRequest {
    phone_fulls: Vec<String>,
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<ContactProfile>,
}

#[derive(Deserialize)]
struct ContactSyncRequest {
    entries: Vec<ContactEntry>,
}

async fn update_push_token(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<PushTokenRequest>,
) -> Result<StatusCode, ServerError> {
    state.users.update_push_token(
        &caller,
        req.service,
        &req.token,
        req.bundle_id.as_deref(),
        req.app_id.as_deref(),
    )?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_profile(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<ProfileView>, ServerError> {
    let view = state
        .users
        .update_profile(&caller, &req.first_name, &req.last_name)?;
    Ok(Json(view))
}

async fn update_username(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<UsernameRequest>,
) -> Result<Json<UsernameResponse>, ServerError> {
    let username = state.users.update_username(&caller, &req.username)?;
    Ok(Json(UsernameResponse { username }))
}

async fn search_by_username(
    State(state): State<AppState>,
    _caller: Caller,
    Query(params): Query<SearchParams>,
) -> Result<Json<UsersResponse>, ServerError> {
    let users = state.users.search_by_username(&params.q)?;
    Ok(Json(UsersResponse { users }))
}

async fn search_by_phone_full(
    State(state): State<AppState>,
    _caller: Caller,
    Query(params): Query<SearchParams>,
) -> Result<Json<UsersResponse>, ServerError> {
    let users = state.users.search_by_phone_full(&params.q)?;
    Ok(Json(UsersResponse { users }))
}

async fn find_by_list_phone_full(
    State(state): State<AppState>,
    _caller: Caller,
    Json(req): Json<LookupRequest>,
) -> Result<Json<UsersResponse>, ServerError> {
    let users = state.users.find_by_list_phone_full(&req.phone_fulls)?;
    Ok(Json(UsersResponse { users }))
}

async fn sync_contacts(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ContactSyncRequest>,
) -> Result<Json<SyncReport>, ServerError> {
    Ok(Json(state.contacts.sync(&caller, req.entries).await?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use courier_shared::protocol::{EnvelopeResponse, MessageKind};
    use courier_shared::types::ThreadKind;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{SESSION_HEADER, USER_HEADER};
    use crate::protocol::tests::client_envelope;
    use crate::testkit::TestServer;

    fn request(method: Method, uri: &str, caller: Option<(&str, &str)>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some((user, session)) = caller {
            builder = builder.header(USER_HEADER, user).header(SESSION_HEADER, session);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let server = TestServer::new();
        let app = build_router(server.state.clone());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn requests_without_known_session_are_forbidden() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        let app = build_router(server.state.clone());

        let anonymous = request(Method::GET, "/v1/sync", None, serde_json::Value::Null);
        let response = app.clone().oneshot(anonymous).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let stale = request(Method::GET, "/v1/sync", Some(("alice", "gone")), serde_json::Value::Null);
        let response = app.oneshot(stale).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn username_and_user_search_routes() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let app = build_router(server.state.clone());

        let claim = serde_json::json!({ "username": "wonder" });
        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/v1/me/username", Some(("alice", "a1")), claim.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["username"], "wonder");

        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/v1/me/username", Some(("bob", "b1")), claim))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request(
                Method::GET,
                "/v1/users/search/username?q=WOND",
                Some(("bob", "b1")),
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["users"][0]["phone_full"], "alice");

        let response = app
            .clone()
            .oneshot(request(
                Method::GET,
                "/v1/users/search/phone?q=bo",
                Some(("alice", "a1")),
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["users"].as_array().unwrap().len(), 1);

        let lookup = serde_json::json!({ "phone_fulls": ["bob", "ghost", "alice"] });
        let response = app
            .oneshot(request(Method::POST, "/v1/users/lookup", Some(("alice", "a1")), lookup))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["users"][0]["phone_full"], "bob");
        assert_eq!(body["users"][1]["phone_full"], "alice");
    }

    #[tokio::test]
    async fn send_over_http_returns_server_date() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let app = build_router(server.state.clone());

        let envelope = client_envelope(
            "alice",
            "a1",
            "bob",
            ThreadId::solo("alice", "bob"),
            ThreadKind::Solo,
            MessageKind::Text,
            "m1",
            b"hello",
        );
        let body = serde_json::json!({ "envelope": envelope.to_base64().unwrap() });
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/v1/messages", Some(("alice", "a1")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        let decoded = EnvelopeResponse::from_base64(json["response"].as_str().unwrap()).unwrap();
        assert_eq!(decoded.code, 200);
        assert_eq!(json["server_date"].as_i64(), decoded.server_date());

        let response = app
            .oneshot(request(
                Method::GET,
                "/v1/messages/unreceived",
                Some(("bob", "b1")),
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["envelopes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_routes_map_errors_to_status() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let app = build_router(server.state.clone());

        let create = serde_json::json!({ "group_name": "crew", "participants": ["alice", "bob"] });
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/v1/groups", Some(("alice", "a1")), create))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = json_body(response).await;
        let id = json["thread"]["thread_id"].as_str().unwrap().to_string();

        let promote = serde_json::json!({ "member": "alice" });
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/v1/groups/{id}/admins/promote"),
                Some(("alice", "a1")),
                promote,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let rename = serde_json::json!({ "name": "mutiny" });
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/v1/groups/{id}/name"),
                Some(("bob", "b1")),
                rename,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request(
                Method::GET,
                "/v1/threads/no-such-thread",
                Some(("bob", "b1")),
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

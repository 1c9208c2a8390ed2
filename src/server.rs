use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

use crate::pipeline::{ReplyOutcome, ReplyPipeline};
use crate::qr;
use crate::session::{ChannelSession, ChatMessage};
use crate::settings::{AiProfile, ProfilePatch};
use crate::store::{DashboardStats, EntityStore, StoreError};
use crate::timer::QrRefreshTimer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EntityStore>,
    pub pipeline: ReplyPipeline,
    pub qr: Arc<QrRefreshTimer>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::ChannelNotFound(_) | StoreError::ProfileNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::ChannelNotConnected(_) => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct ProfilesResponse {
    profiles: Vec<AiProfile>,
}

async fn list_profiles(State(state): State<AppState>) -> Json<ProfilesResponse> {
    Json(ProfilesResponse { profiles: state.store.profiles().await })
}

async fn patch_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ProfilePatch>,
) -> ApiResult<AiProfile> {
    Ok(Json(state.store.update_profile(&id, patch).await?))
}

#[derive(Debug, Serialize)]
struct ChannelView {
    #[serde(flatten)]
    session: ChannelSession,
    generating: bool,
}

impl ChannelView {
    fn new(state: &AppState, session: ChannelSession) -> Self {
        let generating = state.pipeline.is_generating(&session.id);
        Self { session, generating }
    }
}

#[derive(Debug, Serialize)]
struct ChannelsResponse {
    channels: Vec<ChannelView>,
}

async fn list_channels(State(state): State<AppState>) -> Json<ChannelsResponse> {
    let channels = state.store.channels().await.into_iter().map(|s| ChannelView::new(&state, s)).collect();
    Json(ChannelsResponse { channels })
}

async fn create_channel(State(state): State<AppState>) -> Result<(StatusCode, Json<ChannelView>), ApiError> {
    let session = state.store.create_channel().await?;
    Ok((StatusCode::CREATED, Json(ChannelView::new(&state, session))))
}

async fn get_channel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ChannelView> {
    let session = state.store.channel(&id).await.ok_or(StoreError::ChannelNotFound(id))?;
    Ok(Json(ChannelView::new(&state, session)))
}

async fn delete_channel(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.store.delete_channel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct TransitionResponse {
    channel: ChannelView,
    changed: bool,
}

async fn connect_channel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TransitionResponse> {
    let changed = state.store.connect(&id).await?;
    transition_response(&state, id, changed).await
}

async fn disconnect_channel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TransitionResponse> {
    let changed = state.store.disconnect(&id).await?;
    transition_response(&state, id, changed).await
}

async fn transition_response(state: &AppState, id: String, changed: bool) -> ApiResult<TransitionResponse> {
    let session = state.store.channel(&id).await.ok_or(StoreError::ChannelNotFound(id))?;
    Ok(Json(TransitionResponse { channel: ChannelView::new(state, session), changed }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignProfileBody {
    ai_profile_id: String,
}

async fn assign_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignProfileBody>,
) -> ApiResult<ChannelView> {
    let session = state.store.assign_profile(&id, &body.ai_profile_id).await?;
    Ok(Json(ChannelView::new(&state, session)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateBody {
    sender_name: String,
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct SimulateQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    inbound: ChatMessage,
    generating: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum SimulateResponse {
    Accepted(AcceptedResponse),
    Completed(ReplyOutcome),
}

async fn simulate_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SimulateQuery>,
    Json(body): Json<SimulateBody>,
) -> Result<(StatusCode, Json<SimulateResponse>), ApiError> {
    let session = state.store.channel(&id).await.ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
    if !session.is_connected() {
        return Err(StoreError::ChannelNotConnected(id).into());
    }
    let pending = state
        .pipeline
        .begin(&id, &body.sender_name, &body.text)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::CONFLICT, "channel became unavailable"))?;

    if query.wait {
        let outcome = pending.finish().await;
        return Ok((StatusCode::OK, Json(SimulateResponse::Completed(outcome))));
    }
    let inbound = pending.inbound().clone();
    tokio::spawn(async move {
        let outcome = pending.finish().await;
        tracing::debug!(channel = %outcome.channel_id, delivered = outcome.delivered, "background reply finished");
    });
    Ok((StatusCode::ACCEPTED, Json(SimulateResponse::Accepted(AcceptedResponse { inbound, generating: true }))))
}

#[derive(Debug, Serialize)]
struct ClearedResponse {
    cleared: usize,
}

async fn clear_messages(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ClearedResponse> {
    let cleared = state.store.clear_messages(&id).await?;
    Ok(Json(ClearedResponse { cleared }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QrResponse {
    channel_id: String,
    status: &'static str,
    payload: String,
    placeholder: bool,
    generation: u64,
    seconds_remaining: u64,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
enum QrFormat {
    #[default]
    Json,
    Svg,
}

#[derive(Debug, Deserialize, Default)]
struct QrQuery {
    #[serde(default)]
    format: QrFormat,
}

async fn channel_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<QrQuery>,
) -> Result<Response, ApiError> {
    let session = state.store.channel(&id).await.ok_or(StoreError::ChannelNotFound(id))?;
    let snap = state.qr.current();
    let (payload, placeholder) = match session.qr_payload {
        Some(p) => (p, false),
        None => (snap.payload, true),
    };
    if query.format == QrFormat::Svg {
        let svg = qr::render_svg(&payload, placeholder).map_err(|e| {
            tracing::warn!(channel = %session.id, error = %e, "qr rendering failed");
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, format!("cannot render qr code: {e}"))
        })?;
        return Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response());
    }
    Ok(Json(QrResponse {
        channel_id: session.id,
        status: session.status.as_str(),
        payload,
        placeholder,
        generation: snap.generation,
        seconds_remaining: snap.seconds_remaining,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    #[serde(flatten)]
    stats: DashboardStats,
    generating: Vec<String>,
}

async fn dashboard(State(state): State<AppState>) -> Json<DashboardResponse> {
    let stats = state.store.stats().await;
    Json(DashboardResponse { stats, generating: state.pipeline.generating_channels() })
}

async fn metrics_text(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(|h| h.render()).ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/profiles", get(list_profiles))
        .route("/v1/profiles/:id", patch(patch_profile))
        .route("/v1/channels", get(list_channels).post(create_channel))
        .route("/v1/channels/:id", get(get_channel).delete(delete_channel))
        .route("/v1/channels/:id/connect", post(connect_channel))
        .route("/v1/channels/:id/disconnect", post(disconnect_channel))
        .route("/v1/channels/:id/profile", put(assign_profile))
        .route("/v1/channels/:id/messages", post(simulate_message).delete(clear_messages))
        .route("/v1/channels/:id/qr", get(channel_qr))
        .route("/v1/dashboard", get(dashboard))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    state.qr.start();
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    state.qr.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompletionError, CompletionRequest, CompletionResponse, CompletionService};
    use crate::pipeline::ReplyTexts;
    use crate::storage::MemoryKeyValueStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct EchoCompletion;

    #[async_trait]
    impl CompletionService for EchoCompletion {
        fn is_configured(&self) -> bool {
            true
        }

        async fn generate(&self, req: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
            Ok(CompletionResponse { text: Some(format!("echo {}", req.prompt)), model: req.model })
        }
    }

    async fn spawn_app() -> (String, AppState) {
        let store = Arc::new(EntityStore::load(Arc::new(MemoryKeyValueStore::new())).await);
        let pipeline = ReplyPipeline::new(store.clone(), Arc::new(EchoCompletion));
        let state = AppState {
            store,
            pipeline,
            qr: Arc::new(QrRefreshTimer::new(Duration::from_secs(20))),
            metrics: None,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn channel_lifecycle_over_http() {
        let (base, _state) = spawn_app().await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/v1/channels")).send().await.unwrap();
        assert_eq!(resp.status(), 201);
        let created: Value = resp.json().await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "disconnected");
        assert_eq!(created["generating"], false);

        let list: Value = client.get(format!("{base}/v1/channels")).send().await.unwrap().json().await.unwrap();
        assert_eq!(list["channels"].as_array().unwrap().len(), 1);

        let qr: Value = client.get(format!("{base}/v1/channels/{id}/qr")).send().await.unwrap().json().await.unwrap();
        assert_eq!(qr["placeholder"], true);
        assert!(qr["payload"].as_str().unwrap().starts_with(crate::timer::PLACEHOLDER_PREFIX));

        let t: Value = client.post(format!("{base}/v1/channels/{id}/connect")).send().await.unwrap().json().await.unwrap();
        assert_eq!(t["changed"], true);
        assert_eq!(t["channel"]["status"], "connected");

        let resp = client.delete(format!("{base}/v1/channels/{id}")).send().await.unwrap();
        assert_eq!(resp.status(), 204);
        let resp = client.get(format!("{base}/v1/channels/{id}")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn simulate_message_requires_connection() {
        let (base, state) = spawn_app().await;
        let client = reqwest::Client::new();
        let id = state.store.create_channel().await.unwrap().id;

        let resp = client
            .post(format!("{base}/v1/channels/{id}/messages"))
            .json(&json!({"senderName": "Ahmed", "text": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        assert!(state.store.channel(&id).await.unwrap().messages.is_empty());

        let resp = client
            .post(format!("{base}/v1/channels/Bot-0/messages"))
            .json(&json!({"senderName": "Ahmed", "text": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn simulate_message_wait_and_background() {
        let (base, state) = spawn_app().await;
        let client = reqwest::Client::new();
        let id = state.store.create_channel().await.unwrap().id;
        state.store.connect(&id).await.unwrap();

        let resp = client
            .post(format!("{base}/v1/channels/{id}/messages?wait=true"))
            .json(&json!({"senderName": "Ahmed", "text": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let outcome: Value = resp.json().await.unwrap();
        assert_eq!(outcome["outbound"]["text"], "echo Message from Ahmed: hello");
        assert_eq!(outcome["outbound"]["senderName"], ReplyTexts::default().assistant_name);
        assert_eq!(outcome["delivered"], true);

        let mut rx = state.store.subscribe();
        let resp = client
            .post(format!("{base}/v1/channels/{id}/messages"))
            .json(&json!({"senderName": "Sara", "text": "help"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let accepted: Value = resp.json().await.unwrap();
        assert_eq!(accepted["inbound"]["text"], "help");
        assert_eq!(accepted["inbound"]["direction"], "inbound");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if state.store.channel(&id).await.unwrap().messages.len() == 4 {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let cleared: Value = client.delete(format!("{base}/v1/channels/{id}/messages")).send().await.unwrap().json().await.unwrap();
        assert_eq!(cleared["cleared"], 4);
        let dash: Value = client.get(format!("{base}/v1/dashboard")).send().await.unwrap().json().await.unwrap();
        assert_eq!(dash["channels"], 1);
        assert_eq!(dash["connected"], 1);
        assert_eq!(dash["messages"], 0);
    }

    #[tokio::test]
    async fn profile_patch_and_assignment() {
        let (base, state) = spawn_app().await;
        let client = reqwest::Client::new();
        let profiles: Value = client.get(format!("{base}/v1/profiles")).send().await.unwrap().json().await.unwrap();
        let pid = profiles["profiles"][0]["id"].as_str().unwrap().to_string();

        let patched: Value = client
            .patch(format!("{base}/v1/profiles/{pid}"))
            .json(&json!({"name": "Farida", "temperature": 5.0}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(patched["name"], "Farida");
        assert_eq!(patched["temperature"], 2.0);

        let resp = client.patch(format!("{base}/v1/profiles/ghost")).json(&json!({"name": "x"})).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let id = state.store.create_channel().await.unwrap().id;
        let resp = client
            .put(format!("{base}/v1/channels/{id}/profile"))
            .json(&json!({"aiProfileId": "ghost"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let resp = client
            .put(format!("{base}/v1/channels/{id}/profile"))
            .json(&json!({"aiProfileId": pid}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn qr_route_renders_svg_for_placeholder_and_payload() {
        let (base, state) = spawn_app().await;
        let client = reqwest::Client::new();
        let id = state.store.create_channel().await.unwrap().id;

        let resp = client.get(format!("{base}/v1/channels/{id}/qr?format=svg")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/svg+xml");
        let placeholder = resp.text().await.unwrap();
        assert!(placeholder.contains("<svg"));
        assert!(placeholder.trim_end().ends_with("</svg>"));
        assert!(placeholder.contains("#00000033"));

        state
            .store
            .mutate(|s| {
                s.sessions[0].qr_payload = Some("BRG-AB12C:pairing-token".into());
                Ok(())
            })
            .await
            .unwrap();
        let real = client.get(format!("{base}/v1/channels/{id}/qr?format=svg")).send().await.unwrap().text().await.unwrap();
        assert!(real.contains("<svg"));
        assert!(!real.contains("#00000033"));
        assert_ne!(real, placeholder);

        let qr: Value = client.get(format!("{base}/v1/channels/{id}/qr")).send().await.unwrap().json().await.unwrap();
        assert_eq!(qr["placeholder"], false);
        assert_eq!(qr["payload"], "BRG-AB12C:pairing-token");

        let resp = client.get(format!("{base}/v1/channels/{id}/qr?format=png")).send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let resp = client.get(format!("{base}/v1/channels/Bot-0/qr?format=svg")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn metrics_route_absent_without_recorder() {
        let (base, _state) = spawn_app().await;
        let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(resp.status(), 404);
    }
}

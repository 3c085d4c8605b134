#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chatline_domain::RoomId;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::HubSettings;
use crate::server::auth::{TokenService, extract_token};
use crate::server::connection::{self, ConnectionSettings};
use crate::server::hub::HubHandle;
use crate::server::message_store::MessageStore;
use crate::server::presence::PresenceStore;
use crate::server::room_registry::RoomRegistry;

/// Everything an HTTP handler needs to act: the Hub front door and the three ambient
/// collaborators, plus the settings every upgraded Connection is built with (§4.8).
#[derive(Clone)]
pub struct AppState {
	pub hub: HubHandle,
	pub token_service: Arc<TokenService>,
	pub message_store: MessageStore,
	pub presence: PresenceStore,
	pub room_registry: RoomRegistry,
	pub connection_settings: ConnectionSettings,
	pub default_room: RoomId,
	pub history_limit: i64,
	pub metrics_handle: PrometheusHandle,
}

impl AppState {
	pub fn connection_settings_from(hub: &HubSettings) -> ConnectionSettings {
		ConnectionSettings {
			write_wait: hub.write_wait,
			pong_wait: hub.pong_wait,
			ping_period: hub.ping_period,
			outbound_queue_capacity: hub.outbound_queue_capacity,
			command_rate_limit_per_conn_burst: hub.command_rate_limit_per_conn_burst,
			command_rate_limit_per_conn_per_minute: hub.command_rate_limit_per_conn_per_minute,
		}
	}
}

pub fn router(state: AppState) -> Router {
	#[derive(OpenApi)]
	#[openapi(
		paths(history, create_room, presence),
		components(schemas(ChatMessageView, CreateRoomRequest, PresenceResponse)),
		tags((name = "chatline", description = "Real-time chat backend REST side-channel"))
	)]
	struct ApiDoc;

	Router::new()
		.route("/ws/chat", get(upgrade))
		.route("/chat/history/{room_id}", get(history))
		.route("/chat/rooms", post(create_room))
		.route("/chat/rooms/{room_id}/presence", get(presence))
		.route("/metrics", get(metrics))
		.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
		.layer(CorsLayer::permissive())
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
	token: Option<String>,
	room_id: Option<String>,
}

/// `GET /ws/chat?token=<jwt>&room_id=<string>` (§6). Validates the token, resolves the target
/// room (defaulting and idempotently registering it), then hands the upgraded socket to
/// [`connection::handle_connection`].
async fn upgrade(
	State(state): State<AppState>,
	Query(query): Query<UpgradeQuery>,
	headers: HeaderMap,
	ws: WebSocketUpgrade,
) -> Response {
	let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());

	let Some(token) = extract_token(query.token.as_deref(), auth_header) else {
		return (StatusCode::UNAUTHORIZED, "missing token").into_response();
	};

	let principal = match state.token_service.validate(&token) {
		Ok(p) => p,
		Err(e) => {
			info!(error = %e, "upgrade rejected: invalid token");
			return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
		}
	};

	let requested = query.room_id.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| state.default_room.as_str().to_string());

	let room_id = match RoomId::new(requested) {
		Ok(r) => r,
		Err(_) => return (StatusCode::BAD_REQUEST, "room_id must be non-empty").into_response(),
	};

	if let Err(e) = state.room_registry.ensure(room_id.as_str()).await {
		warn!(error = %e, room = %room_id, "upgrade rejected: room registry unavailable");
		return (StatusCode::INTERNAL_SERVER_ERROR, "room registry unavailable").into_response();
	}

	let settings = state.connection_settings.clone();
	let hub = state.hub.clone();
	let message_store = state.message_store.clone();
	let presence = state.presence.clone();

	ws.on_upgrade(move |socket| connection::handle_connection(socket, principal, room_id, settings, hub, message_store, presence))
}

#[derive(Debug, Serialize, ToSchema)]
struct ChatMessageView {
	room_id: String,
	user_id: String,
	content: String,
	timestamp: String,
}

impl From<chatline_domain::ChatMessage> for ChatMessageView {
	fn from(m: chatline_domain::ChatMessage) -> Self {
		Self { room_id: m.room_id, user_id: m.user_id, content: m.content, timestamp: m.timestamp }
	}
}

/// `GET /chat/history/{room_id}` — newest-first, capped at the configured history limit (§6).
#[utoipa::path(
	get,
	path = "/chat/history/{room_id}",
	params(("room_id" = String, Path, description = "Room identifier")),
	responses((status = 200, description = "Newest-first message list", body = [ChatMessageView])),
	tag = "chatline"
)]
async fn history(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
	match state.message_store.query(&room_id, state.history_limit).await {
		Ok(rows) => {
			let view: Vec<ChatMessageView> = rows.into_iter().map(ChatMessageView::from).collect();
			axum::Json(view).into_response()
		}
		Err(e) => {
			warn!(error = %e, room = %room_id, "history query failed");
			(StatusCode::INTERNAL_SERVER_ERROR, "history query failed").into_response()
		}
	}
}

#[derive(Debug, Deserialize, ToSchema)]
struct CreateRoomRequest {
	room_id: String,
}

/// `POST /chat/rooms` — idempotent room creation (§6).
#[utoipa::path(
	post,
	path = "/chat/rooms",
	request_body = CreateRoomRequest,
	responses((status = 204, description = "Room exists (created or already present)")),
	tag = "chatline"
)]
async fn create_room(State(state): State<AppState>, axum::Json(body): axum::Json<CreateRoomRequest>) -> Response {
	let room_id = match RoomId::new(body.room_id) {
		Ok(r) => r,
		Err(_) => return (StatusCode::BAD_REQUEST, "room_id must be non-empty").into_response(),
	};

	match state.room_registry.ensure(room_id.as_str()).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(e) => {
			warn!(error = %e, room = %room_id, "room creation failed");
			(StatusCode::INTERNAL_SERVER_ERROR, "room creation failed").into_response()
		}
	}
}

#[derive(Debug, Serialize, ToSchema)]
struct PresenceResponse {
	room_id: String,
	online: u64,
}

/// `GET /chat/rooms/{room_id}/presence` — live member count, reaping stale entries (§6).
#[utoipa::path(
	get,
	path = "/chat/rooms/{room_id}/presence",
	params(("room_id" = String, Path, description = "Room identifier")),
	responses((status = 200, description = "Presence count", body = PresenceResponse)),
	tag = "chatline"
)]
async fn presence(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
	let room = match RoomId::new(room_id) {
		Ok(r) => r,
		Err(_) => return (StatusCode::BAD_REQUEST, "room_id must be non-empty").into_response(),
	};

	match state.presence.count(&room).await {
		Ok(online) => axum::Json(PresenceResponse { room_id: room.into_string(), online }).into_response(),
		Err(e) => {
			warn!(error = %e, room = %room, "presence count failed");
			(StatusCode::INTERNAL_SERVER_ERROR, "presence count failed").into_response()
		}
	}
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
	state.metrics_handle.render()
}

//! HTTP and WebSocket surface: room CRUD, login/renew and the chat socket.

use axum::{
  extract::{
    rejection::JsonRejection,
    ws::{WebSocket, WebSocketUpgrade},
    MatchedPath, Path, Request, State,
  },
  http::{header, HeaderMap, Method, StatusCode},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, RequestPartsExt, Router,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

use crate::{
  auth::AuthTokenService,
  config::Config,
  error::{ApiError, ApiResult, ErrorCode},
  event::ChatEvent,
  pump::{self, PumpSettings},
  room::{Room, RoomForm, RoomId, RoomRegistry, RoomView},
};

/// Shared handles given to every handler.
#[derive(Clone)]
pub struct AppState {
  pub registry: RoomRegistry,
  pub auth: AuthTokenService,
  pub settings: PumpSettings,
}

impl AppState {
  pub fn new(config: &Config) -> Self {
    Self {
      registry: RoomRegistry::new(),
      auth: AuthTokenService::new(&config.secret_key, config.token_ttl),
      settings: PumpSettings::default(),
    }
  }
}

/// What a route requires before its handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
  /// No token needed.
  Open,
  /// A valid token for the addressed room, unless that room is public.
  RoomToken,
}

#[derive(Debug)]
pub struct RoutePolicy {
  pub method: Method,
  pub path: &'static str,
  pub policy: AuthPolicy,
}

pub static ROUTE_POLICIES: &[RoutePolicy] = &[
  RoutePolicy { method: Method::GET, path: "/chats", policy: AuthPolicy::Open },
  RoutePolicy { method: Method::POST, path: "/chats", policy: AuthPolicy::Open },
  RoutePolicy { method: Method::GET, path: "/chats/{room}", policy: AuthPolicy::Open },
  RoutePolicy { method: Method::PUT, path: "/chats/{room}", policy: AuthPolicy::RoomToken },
  RoutePolicy { method: Method::DELETE, path: "/chats/{room}", policy: AuthPolicy::RoomToken },
  RoutePolicy { method: Method::POST, path: "/chats/{room}/token", policy: AuthPolicy::Open },
  RoutePolicy { method: Method::GET, path: "/chats/{room}/token/renew", policy: AuthPolicy::Open },
  RoutePolicy { method: Method::GET, path: "/chats/{room}/ws", policy: AuthPolicy::RoomToken },
];

/// Policy for a matched route. Anything unlisted needs a room token.
pub fn policy_for(method: &Method, path: &str) -> AuthPolicy {
  ROUTE_POLICIES
    .iter()
    .find(|route| route.method == method && route.path == path)
    .map(|route| route.policy)
    .unwrap_or(AuthPolicy::RoomToken)
}

/// Chat API routes with the authorization gate applied.
pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/chats", get(list_rooms).post(create_room))
    .route("/chats/{room}", get(get_room).put(update_room).delete(delete_room))
    .route("/chats/{room}/token", post(login))
    .route("/chats/{room}/token/renew", get(renew))
    .route("/chats/{room}/ws", get(chat_socket))
    .route_layer(middleware::from_fn_with_state(state.clone(), authorize))
    .with_state(state)
}

async fn authorize(State(state): State<AppState>, request: Request, next: Next) -> Response {
  match check(&state, request).await {
    Ok(request) => next.run(request).await,
    Err(e) => e.into_response(),
  }
}

async fn check(state: &AppState, request: Request) -> ApiResult<Request> {
  let Some(path) = request.extensions().get::<MatchedPath>().map(|p| p.as_str().to_owned()) else {
    return Ok(request);
  };
  if policy_for(request.method(), &path) == AuthPolicy::Open {
    return Ok(request);
  }

  let (mut parts, body) = request.into_parts();
  let Path(params) = parts
    .extract::<Path<HashMap<String, String>>>()
    .await
    .map_err(|_| ApiError::invalid_content("room"))?;
  let identifier = params.get("room").map(String::as_str).unwrap_or_default();

  let room = state.registry.retrieve(identifier).await?;
  if !room.is_public().await {
    let token = bearer_token(&parts.headers).ok_or_else(ApiError::invalid_token)?;
    state.auth.validate(&token, &room).await?;
  }
  Ok(Request::from_parts(parts, body))
}

/// Token from `Authorization` (with or without a scheme), else from
/// `Sec-WebSocket-Protocol`, since browsers cannot set headers on an upgrade.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
  let authorization = headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.split_whitespace().last().unwrap_or_default().to_string())
    .filter(|t| !t.is_empty());
  authorization.or_else(|| subprotocol(headers))
}

fn subprotocol(headers: &HeaderMap) -> Option<String> {
  headers
    .get(header::SEC_WEBSOCKET_PROTOCOL)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_string())
    .filter(|t| !t.is_empty())
}

impl From<JsonRejection> for ApiError {
  fn from(rejection: JsonRejection) -> Self {
    warn!("rejected request body: {}", rejection.body_text());
    ApiError::new(ErrorCode::InvalidJson)
  }
}

fn success() -> Response {
  Json(json!({ "status": true })).into_response()
}

/// Body of a successful login or renewal.
#[derive(Debug, Serialize)]
pub struct TokenGrant {
  pub status: bool,
  pub name: String,
  pub room_id: RoomId,
  pub token: String,
}

impl IntoResponse for TokenGrant {
  fn into_response(self) -> Response {
    (StatusCode::CREATED, Json(self)).into_response()
  }
}

// GET /chats
async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomView>> {
  let mut views = Vec::new();
  for room in state.registry.list().await {
    views.push(room.view().await);
  }
  Json(views)
}

// POST /chats
async fn create_room(
  State(state): State<AppState>,
  body: Result<Json<RoomForm>, JsonRejection>,
) -> ApiResult<Response> {
  let Json(form) = body?;
  let room = state.registry.add(form).await?;
  Ok((StatusCode::CREATED, Json(room.view().await)).into_response())
}

// GET /chats/{room}
async fn get_room(State(state): State<AppState>, Path(room): Path<String>) -> ApiResult<Json<RoomView>> {
  let room = state.registry.retrieve(&room).await?;
  Ok(Json(room.view().await))
}

// PUT /chats/{room}
async fn update_room(
  State(state): State<AppState>,
  Path(room): Path<String>,
  body: Result<Json<RoomForm>, JsonRejection>,
) -> ApiResult<Json<RoomView>> {
  let Json(form) = body?;
  let room = state.registry.update(&room, form).await?;
  Ok(Json(room.view().await))
}

// DELETE /chats/{room}
async fn delete_room(State(state): State<AppState>, Path(room): Path<String>) -> ApiResult<Response> {
  let room = state.registry.retrieve(&room).await?;
  state.registry.delete(&room).await?;
  Ok(success())
}

// POST /chats/{room}/token
async fn login(
  State(state): State<AppState>,
  Path(room): Path<String>,
  body: Result<Json<ChatEvent>, JsonRejection>,
) -> ApiResult<Response> {
  let Json(request) = body?;
  let room = state.registry.retrieve(&room).await?;
  if room.is_public().await {
    return Ok(success());
  }

  let token = state.auth.issue_token(&room, &request.user, &request.secret).await?;
  info!(room_id = room.id(), user = %request.user, "issued room token");
  Ok(
    TokenGrant {
      status: true,
      name: request.user,
      room_id: room.id(),
      token,
    }
    .into_response(),
  )
}

// GET /chats/{room}/token/renew
async fn renew(
  State(state): State<AppState>,
  Path(room): Path<String>,
  headers: HeaderMap,
) -> ApiResult<Response> {
  let room = state.registry.retrieve(&room).await?;
  if room.is_public().await {
    return Ok(success());
  }

  let old = bearer_token(&headers).ok_or_else(ApiError::invalid_token)?;
  let token = state.auth.refresh_token(&old, &room).await?;
  let claims = state.auth.validate(&token, &room).await?;
  Ok(
    TokenGrant {
      status: true,
      name: claims.name,
      room_id: room.id(),
      token,
    }
    .into_response(),
  )
}

// GET /chats/{room}/ws
async fn chat_socket(
  State(state): State<AppState>,
  Path(room): Path<String>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> ApiResult<Response> {
  let room = state.registry.retrieve(&room).await?;
  let settings = state.settings;

  let mut ws = ws.max_message_size(settings.max_message_size);
  // A token passed as subprotocol has to be echoed or browsers drop the socket.
  if let Some(protocol) = subprotocol(&headers) {
    ws = ws.protocols([protocol]);
  }

  Ok(ws.on_upgrade(move |socket| serve_socket(socket, room, settings)))
}

async fn serve_socket(socket: WebSocket, room: Arc<Room>, settings: PumpSettings) {
  let (sink, stream) = socket.split();

  let (session, queue) = match pump::connect(room.clone(), &settings).await {
    Ok(attached) => attached,
    Err(e) => {
      let err = ApiError::new(ErrorCode::CouldNotEstablishSession);
      warn!(room_id = room.id(), "{}: {}", err, e);
      return;
    }
  };

  tokio::spawn(pump::write_pump(sink, queue, settings));
  pump::read_pump(stream, session, settings).await;
}

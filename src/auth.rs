//! Room-scoped bearer tokens.
//!
//! Tokens are HS256 JWTs carrying the username, the room id and an expiry.
//! The signing key is never stored: it is derived from the process secret,
//! the room's credential hash and the room id each time it is needed. Changing
//! a room's credential therefore invalidates every token issued for it, and a
//! token for one room never validates against another.
//!
//! ## Example Usage
//! ```no_run
//! use neochat::{auth::AuthTokenService, room::RoomRegistry};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = RoomRegistry::new();
//!     let lobby = registry.retrieve("1").await.unwrap();
//!     let auth = AuthTokenService::new("super-secret-key", Duration::from_secs(900));
//!
//!     let token = auth.issue_token(&lobby, "alice", "").await.unwrap();
//!     let claims = auth.validate(&token, &lobby).await.unwrap();
//!     assert_eq!(claims.name, "alice");
//! }
//! ```
use jsonwebtoken::{
  decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};
use tracing::debug;

use crate::{
  error::{ApiError, ApiResult, ErrorCode},
  room::{Room, RoomId, Visibility},
};

/// Payload of a room token.
///
/// ## Fields
/// - `name`: Username the token was issued to.
/// - `room_id`: Room the token grants access to.
/// - `exp`: UNIX timestamp after which the token is rejected.
/// - `jti`: Per-issue nonce, so a renewal never reproduces the old token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
  pub name: String,
  pub room_id: RoomId,
  pub exp: usize,
  #[serde(default)]
  pub jti: String,
}

/// Issues, validates and refreshes tokens scoped to a single room.
#[derive(Clone)]
pub struct AuthTokenService {
  secret: String,
  ttl: Duration,
}

impl AuthTokenService {
  /// Creates a new service.
  ///
  /// ## Parameters
  /// - `secret`: Process-wide secret mixed into every room's signing key.
  /// - `ttl`: Lifetime of issued tokens.
  pub fn new(secret: &str, ttl: Duration) -> Self {
    Self {
      secret: secret.into(),
      ttl,
    }
  }

  /// Signs a token for `username` in `room` after checking the credential.
  ///
  /// Public rooms skip the credential check entirely.
  ///
  /// ## Parameters
  /// - `room`: Room being entered.
  /// - `username`: Name to embed in the token. Must not be empty.
  /// - `credential`: Plain-text room credential supplied by the client.
  ///
  /// ## Returns
  /// - `ApiResult<String>`: Encoded token, `InvalidContent` for an empty name,
  ///   or `Unauthorized` when the credential does not match.
  pub async fn issue_token(&self, room: &Room, username: &str, credential: &str) -> ApiResult<String> {
    if username.trim().is_empty() {
      return Err(ApiError::invalid_content("name"));
    }

    let details = room.details().await;
    if details.visibility != Visibility::Public {
      let supplied = credential.to_string();
      let stored = details.credential.clone();
      let matches = tokio::task::spawn_blocking(move || bcrypt::verify(supplied, &stored))
        .await
        .map_err(|_| ApiError::with_field(ErrorCode::Unauthorized, "secret"))?
        .unwrap_or(false);
      if !matches {
        return Err(ApiError::with_field(ErrorCode::Unauthorized, "secret"));
      }
    }

    let claims = self.claims(username.to_string(), room.id());
    debug!(room_id = room.id(), user = username, "issuing room token");
    self.sign(&claims, &details.credential, room.id())
  }

  /// Verifies `token` against `room` and signs a fresh one with the same claims.
  ///
  /// ## Returns
  /// - `ApiResult<String>`: New token, or `InvalidToken` when the old one fails.
  pub async fn refresh_token(&self, token: &str, room: &Room) -> ApiResult<String> {
    let old = self.validate(token, room).await?;
    let claims = self.claims(old.name, old.room_id);
    self.sign(&claims, &room.credential().await, room.id())
  }

  /// Checks signature, algorithm, expiry and room binding.
  ///
  /// ## Returns
  /// - `ApiResult<Claims>`: Decoded claims, `UnauthorizedSigningMethod` for a
  ///   token signed with anything other than HS256, `InvalidToken` otherwise.
  pub async fn validate(&self, token: &str, room: &Room) -> ApiResult<Claims> {
    let key = self.signing_key(&room.credential().await, room.id());

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(&key), &validation).map_err(|e| {
      match e.kind() {
        ErrorKind::InvalidAlgorithm => ApiError::with_field(ErrorCode::UnauthorizedSigningMethod, "token"),
        _ => ApiError::invalid_token(),
      }
    })?;

    if data.claims.room_id != room.id() {
      return Err(ApiError::invalid_token());
    }
    Ok(data.claims)
  }

  fn claims(&self, name: String, room_id: RoomId) -> Claims {
    static ISSUED: AtomicU64 = AtomicU64::new(0);

    let now = chrono::Utc::now();
    let exp = now.timestamp().saturating_add(self.ttl.as_secs() as i64) as usize;
    let nonce = ISSUED.fetch_add(1, Ordering::Relaxed);
    Claims {
      name,
      room_id,
      exp,
      jti: format!("{:x}-{:x}", now.timestamp_subsec_nanos(), nonce),
    }
  }

  fn sign(&self, claims: &Claims, credential: &str, room_id: RoomId) -> ApiResult<String> {
    let key = self.signing_key(credential, room_id);
    encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(&key))
      .map_err(|_| ApiError::new(ErrorCode::CouldNotEstablishSession))
  }

  /// `secret ++ credential hash ++ room id`.
  fn signing_key(&self, credential: &str, room_id: RoomId) -> Vec<u8> {
    format!("{}{}{}", self.secret, credential, room_id).into_bytes()
  }
}


/// ######################################## TESTS ########################################

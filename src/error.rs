//! Structured API errors shared by the registry, auth and HTTP layers.

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde::Serialize;
use thiserror::Error;

/// Stable numeric error codes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
  RoomNotFound = 101,
  DuplicateRoom = 102,
  InvalidJson = 103,
  RoomUnauthorized = 104,
  InvalidContent = 105,
  UserNotFound = 201,
  DuplicateUsername = 202,
  ClientUnauthorized = 204,
  CouldNotEstablishSession = 301,
  InvalidEvent = 303,
  Unauthorized = 304,
  UnauthorizedSigningMethod = 402,
  InvalidToken = 403,
}

impl ErrorCode {
  pub fn as_u16(self) -> u16 {
    self as u16
  }

  /// Human-readable message for this code.
  pub fn message(self) -> &'static str {
    use ErrorCode::*;
    match self {
      RoomNotFound => "Room error: Room not found",
      DuplicateRoom => "Room error: Duplicate room",
      InvalidJson => "Room error: Invalid JSON",
      RoomUnauthorized => "Room error: Unauthorized operation",
      InvalidContent => "Room error: Invalid content",
      UserNotFound => "Client error: User not found",
      DuplicateUsername => "Client error: Duplicate username",
      ClientUnauthorized => "Client error: Unauthorized operation",
      CouldNotEstablishSession => "Could not establish session",
      InvalidEvent => "Invalid JSON",
      Unauthorized => "Unauthorized operation",
      UnauthorizedSigningMethod => "Token error: Unauthorized signing method",
      InvalidToken => "Token error: Invalid token",
    }
  }

  /// Transport status for this code.
  pub fn status(self) -> StatusCode {
    match self.as_u16() {
      101 | 201 => StatusCode::NOT_FOUND,
      102 | 103 | 105 | 202 | 303 => StatusCode::BAD_REQUEST,
      104 | 204 | 304 | 402 => StatusCode::UNAUTHORIZED,
      403 => StatusCode::FORBIDDEN,
      _ => StatusCode::BAD_REQUEST,
    }
  }
}

/// A domain error: a code plus the offending field, if any.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} (code {}{})", .code.message(), .code.as_u16(), field_suffix(.field))]
pub struct ApiError {
  pub code: ErrorCode,
  pub field: Option<String>,
}

impl ApiError {
  pub fn new(code: ErrorCode) -> Self {
    Self { code, field: None }
  }

  pub fn with_field(code: ErrorCode, field: impl Into<String>) -> Self {
    Self {
      code,
      field: Some(field.into()),
    }
  }

  pub fn room_not_found(identifier: &str) -> Self {
    Self::with_field(ErrorCode::RoomNotFound, identifier)
  }

  pub fn invalid_content(field: &str) -> Self {
    Self::with_field(ErrorCode::InvalidContent, field)
  }

  pub fn invalid_token() -> Self {
    Self::with_field(ErrorCode::InvalidToken, "token")
  }

  pub fn status(&self) -> StatusCode {
    self.code.status()
  }
}

fn field_suffix(field: &Option<String>) -> String {
  field
    .as_ref()
    .map(|f| format!(", field '{f}'"))
    .unwrap_or_default()
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("Broker for room {0} is no longer running")]
  Stopped(u64),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
  code: u16,
  error: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  field: Option<&'a str>,
}

/// Failure envelope returned by every HTTP handler.
#[derive(Serialize)]
struct Outcome<'a> {
  status: bool,
  error: ErrorBody<'a>,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    tracing::warn!(code = self.code.as_u16(), field = ?self.field, "API error: {}", self.code.message());
    let body = Outcome {
      status: false,
      error: ErrorBody {
        code: self.code.as_u16(),
        error: self.code.message(),
        field: self.field.as_deref(),
      },
    };
    (self.status(), Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codes_map_to_transport_status() {
    assert_eq!(ApiError::room_not_found("x").status(), StatusCode::NOT_FOUND);
    assert_eq!(ApiError::new(ErrorCode::UserNotFound).status(), StatusCode::NOT_FOUND);
    assert_eq!(ApiError::new(ErrorCode::DuplicateRoom).status(), StatusCode::BAD_REQUEST);
    assert_eq!(ApiError::invalid_content("title").status(), StatusCode::BAD_REQUEST);
    assert_eq!(ApiError::new(ErrorCode::Unauthorized).status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
      ApiError::new(ErrorCode::UnauthorizedSigningMethod).status(),
      StatusCode::UNAUTHORIZED
    );
    assert_eq!(ApiError::invalid_token().status(), StatusCode::FORBIDDEN);
    assert_eq!(
      ApiError::new(ErrorCode::CouldNotEstablishSession).status(),
      StatusCode::BAD_REQUEST
    );
  }

  #[test]
  fn display_includes_field() {
    let err = ApiError::invalid_content("title");
    assert_eq!(err.to_string(), "Room error: Invalid content (code 105, field 'title')");
    assert_eq!(
      ApiError::new(ErrorCode::InvalidToken).to_string(),
      "Token error: Invalid token (code 403)"
    );
  }

  #[tokio::test]
  async fn response_body_is_failure_envelope() {
    let response = ApiError::with_field(ErrorCode::DuplicateRoom, "title").into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], false);
    assert_eq!(json["error"]["code"], 102);
    assert_eq!(json["error"]["error"], "Room error: Duplicate room");
    assert_eq!(json["error"]["field"], "title");
  }
}

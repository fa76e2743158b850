//! Chat events exchanged over the WebSocket connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  error::{ApiError, ApiResult, ErrorCode},
  room::RoomId,
};

/// What a [`ChatEvent`] asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventKind {
  /// Bind a username to the connection and announce it.
  #[serde(rename = "join")]
  Subscribe,
  /// Fan a message out to everyone in the room.
  #[serde(rename = "send")]
  Broadcast,
  /// Release the username and announce the departure.
  #[serde(rename = "leave")]
  Unsubscribe,
  #[default]
  #[serde(other)]
  Unknown,
}

impl EventKind {
  pub fn is_unknown(&self) -> bool {
    matches!(self, EventKind::Unknown)
  }
}

fn is_zero(id: &RoomId) -> bool {
  *id == 0
}

/// A single chat action. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
  #[serde(default, skip_serializing_if = "EventKind::is_unknown")]
  pub event_type: EventKind,
  #[serde(rename = "name", default, skip_serializing_if = "String::is_empty")]
  pub user: String,
  #[serde(default, skip_serializing_if = "is_zero")]
  pub room_id: RoomId,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub color: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub msg: String,
  /// Room credential, only read by the login endpoint. Never echoed back.
  #[serde(default, skip_serializing)]
  pub secret: String,
  #[serde(rename = "time", default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<DateTime<Utc>>,
}

impl ChatEvent {
  /// Parse and validate an inbound frame.
  ///
  /// `name` is always required; `msg` is required for broadcasts.
  pub fn decode(data: &[u8]) -> ApiResult<Self> {
    let event: ChatEvent =
      serde_json::from_slice(data).map_err(|_| ApiError::new(ErrorCode::InvalidEvent))?;

    if event.user.is_empty() {
      return Err(ApiError::with_field(ErrorCode::InvalidEvent, "name"));
    }
    if event.event_type == EventKind::Broadcast && event.msg.is_empty() {
      return Err(ApiError::with_field(ErrorCode::InvalidEvent, "msg"));
    }
    Ok(event)
  }

  /// Serialize for the wire.
  pub fn encode(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }

  /// "<user> entered the room." notice.
  pub fn joined(user: &str, color: &str, room_id: RoomId) -> Self {
    Self::notice(EventKind::Subscribe, user, color, room_id, format!("{user} entered the room."))
  }

  /// "<user> has left the room." notice.
  pub fn left(user: &str, color: &str, room_id: RoomId) -> Self {
    Self::notice(EventKind::Unsubscribe, user, color, room_id, format!("{user} has left the room."))
  }

  fn notice(kind: EventKind, user: &str, color: &str, room_id: RoomId, msg: String) -> Self {
    Self {
      event_type: kind,
      user: user.to_string(),
      room_id,
      color: color.to_string(),
      msg,
      secret: String::new(),
      timestamp: Some(Utc::now()),
    }
  }
}

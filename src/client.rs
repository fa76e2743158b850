//! Connection-scoped user handle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use crate::{
  broker::ClientId,
  error::{ApiError, ApiResult, ErrorCode},
};

/// Public view of a client, as listed in a room's `users`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
  pub username: String,
  pub color: String,
  pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
struct Profile {
  username: String,
  color: String,
  last_activity: DateTime<Utc>,
  subscribed: bool,
}

/// One live connection. Lives exactly as long as its socket.
#[derive(Debug)]
pub struct Client {
  id: ClientId,
  profile: Mutex<Profile>,
}

impl Client {
  pub fn new(id: ClientId) -> Self {
    Self {
      id,
      profile: Mutex::new(Profile {
        username: String::new(),
        color: String::new(),
        last_activity: Utc::now(),
        subscribed: false,
      }),
    }
  }

  pub fn id(&self) -> ClientId {
    self.id
  }

  fn profile(&self) -> MutexGuard<'_, Profile> {
    // The profile holds plain data, a poisoned lock still has a usable value.
    self.profile.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn username(&self) -> String {
    self.profile().username.clone()
  }

  pub fn color(&self) -> String {
    self.profile().color.clone()
  }

  pub fn is_subscribed(&self) -> bool {
    self.profile().subscribed
  }

  /// Refused once the client is subscribed under another name.
  pub fn may_bind(&self, username: &str) -> ApiResult<()> {
    let profile = self.profile();
    if profile.subscribed && !profile.username.eq_ignore_ascii_case(username) {
      return Err(ApiError::with_field(ErrorCode::ClientUnauthorized, "name"));
    }
    Ok(())
  }

  /// Set name and color, under the same rule as [`Client::may_bind`].
  pub fn bind(&self, username: &str, color: &str) -> ApiResult<()> {
    self.may_bind(username)?;
    let mut profile = self.profile();
    profile.username = username.to_string();
    profile.color = color.to_string();
    profile.last_activity = Utc::now();
    Ok(())
  }

  pub fn set_subscribed(&self, subscribed: bool) {
    self.profile().subscribed = subscribed;
  }

  /// Record activity now.
  pub fn touch(&self) {
    self.profile().last_activity = Utc::now();
  }

  pub fn last_activity(&self) -> DateTime<Utc> {
    self.profile().last_activity
  }

  pub fn info(&self) -> ClientInfo {
    let profile = self.profile();
    ClientInfo {
      username: profile.username.clone(),
      color: profile.color.clone(),
      last_activity: profile.last_activity,
    }
  }
}

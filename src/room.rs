//! Rooms and the process-wide room registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
  broker::Broker,
  client::{Client, ClientInfo},
  error::{ApiError, ApiResult, ErrorCode},
};

pub type RoomId = u64;

const TITLE_MIN: usize = 2;
const TITLE_MAX: usize = 70;
const DESCRIPTION_MAX: usize = 70;
const CREDENTIAL_MIN: usize = 8;

/// Cheapest bcrypt cost, to keep tests fast.
#[cfg(test)]
pub(crate) const TEST_HASH_COST: u32 = 4;

/// Who may see and enter a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
  /// Listed, no credential.
  Public,
  /// Listed, credential required.
  Private,
  /// Unlisted, credential required.
  Hidden,
}

impl Visibility {
  /// Case-insensitive parse of `public`, `private` or `hidden`.
  pub fn parse(value: &str) -> Option<Self> {
    match value.to_ascii_lowercase().as_str() {
      "public" => Some(Self::Public),
      "private" => Some(Self::Private),
      "hidden" => Some(Self::Hidden),
      _ => None,
    }
  }
}

impl fmt::Display for Visibility {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let name = match self {
      Self::Public => "public",
      Self::Private => "private",
      Self::Hidden => "hidden",
    };
    f.write_str(name)
  }
}

/// Client-supplied room fields for create and update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomForm {
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub visibility: String,
  #[serde(default, alias = "secret")]
  pub password: String,
}

impl RoomForm {
  pub fn new(title: &str, visibility: &str) -> Self {
    Self {
      title: title.to_string(),
      visibility: visibility.to_string(),
      ..Default::default()
    }
  }

  pub fn description(mut self, description: &str) -> Self {
    self.description = description.to_string();
    self
  }

  pub fn password(mut self, password: &str) -> Self {
    self.password = password.to_string();
    self
  }

  /// Check field limits and visibility/credential consistency.
  pub fn validate(&self) -> ApiResult<Visibility> {
    // Limits are in bytes, not characters.
    if !(TITLE_MIN..=TITLE_MAX).contains(&self.title.len()) {
      return Err(ApiError::invalid_content("title"));
    }
    if self.description.len() > DESCRIPTION_MAX {
      return Err(ApiError::invalid_content("description"));
    }
    let visibility =
      Visibility::parse(&self.visibility).ok_or_else(|| ApiError::invalid_content("visibility"))?;
    if visibility != Visibility::Public && self.password.len() < CREDENTIAL_MIN {
      return Err(ApiError::invalid_content("password"));
    }
    // Catches a credential sent for a public room by mistake.
    if visibility == Visibility::Public && !self.password.is_empty() {
      return Err(ApiError::invalid_content("visibility"));
    }
    Ok(visibility)
  }
}

/// Mutable descriptive state of a room.
#[derive(Debug, Clone)]
pub struct RoomDetails {
  pub title: String,
  pub description: String,
  pub visibility: Visibility,
  /// Empty for public rooms, a bcrypt hash otherwise.
  pub credential: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// JSON view of a room with its current members.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
  pub title: String,
  pub description: String,
  pub visibility: Visibility,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub id: RoomId,
  pub users: Vec<ClientInfo>,
}

/// A chat room: identity, details, its broker and subscribed users.
pub struct Room {
  id: RoomId,
  broker: Broker,
  details: RwLock<RoomDetails>,
  /// Lower-cased username to client.
  members: RwLock<HashMap<String, Arc<Client>>>,
}

impl Room {
  /// Create the room and start its broker. Must run inside a Tokio runtime.
  fn new(id: RoomId, details: RoomDetails) -> Self {
    Self {
      id,
      broker: Broker::start(id),
      details: RwLock::new(details),
      members: RwLock::new(HashMap::new()),
    }
  }

  pub fn id(&self) -> RoomId {
    self.id
  }

  pub fn broker(&self) -> &Broker {
    &self.broker
  }

  pub async fn details(&self) -> RoomDetails {
    self.details.read().await.clone()
  }

  pub async fn title(&self) -> String {
    self.details.read().await.title.clone()
  }

  pub async fn visibility(&self) -> Visibility {
    self.details.read().await.visibility
  }

  pub async fn is_public(&self) -> bool {
    self.visibility().await == Visibility::Public
  }

  pub async fn credential(&self) -> String {
    self.details.read().await.credential.clone()
  }

  /// Subscribe a client under `username`. The client's profile is left alone.
  pub async fn add_client(&self, username: &str, client: Arc<Client>) -> ApiResult<()> {
    let key = username.to_lowercase();
    let mut members = self.members.write().await;
    if members.contains_key(&key) {
      return Err(ApiError::with_field(ErrorCode::DuplicateUsername, username));
    }
    members.insert(key, client);
    Ok(())
  }

  /// Unsubscribe `username`, but only if it belongs to `client`.
  pub async fn remove_client(&self, username: &str, client: &Client) -> ApiResult<Arc<Client>> {
    let key = username.to_lowercase();
    let mut members = self.members.write().await;
    let owned = members.get(&key).is_some_and(|member| member.id() == client.id());
    match owned.then(|| members.remove(&key)).flatten() {
      Some(member) => Ok(member),
      None => Err(ApiError::with_field(ErrorCode::UserNotFound, username)),
    }
  }

  pub async fn has_member(&self, username: &str) -> bool {
    self.members.read().await.contains_key(&username.to_lowercase())
  }

  pub async fn members(&self) -> Vec<ClientInfo> {
    let members = self.members.read().await;
    let mut users: Vec<ClientInfo> = members.values().map(|c| c.info()).collect();
    users.sort_by(|a, b| a.username.cmp(&b.username));
    users
  }

  pub async fn view(&self) -> RoomView {
    let details = self.details().await;
    RoomView {
      title: details.title,
      description: details.description,
      visibility: details.visibility,
      created_at: details.created_at,
      updated_at: details.updated_at,
      id: self.id,
      users: self.members().await,
    }
  }
}

impl fmt::Debug for Room {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Room").field("id", &self.id).finish_non_exhaustive()
  }
}

struct Indexes {
  by_id: HashMap<RoomId, Arc<Room>>,
  /// Keyed by lower-cased title.
  by_title: HashMap<String, Arc<Room>>,
  /// Last id handed out. Only ever grows.
  last_id: RoomId,
}

/// Owner of every room in the process.
///
/// Both indexes and the id counter sit behind one lock; every mutation takes
/// it for writing. Cloning shares the same rooms.
#[derive(Clone)]
pub struct RoomRegistry {
  inner: Arc<RwLock<Indexes>>,
  hash_cost: u32,
}

impl RoomRegistry {
  /// Registry seeded with the default public room (id 1).
  ///
  /// Must be called inside a Tokio runtime, since it starts a broker.
  pub fn new() -> Self {
    Self::with_hash_cost(bcrypt::DEFAULT_COST)
  }

  /// Same as [`RoomRegistry::new`] with a custom bcrypt cost.
  pub fn with_hash_cost(hash_cost: u32) -> Self {
    let now = Utc::now();
    let lobby = Arc::new(Room::new(
      1,
      RoomDetails {
        title: "Public Chat".to_string(),
        description: "This is the default chat, available to everyone!".to_string(),
        visibility: Visibility::Public,
        credential: String::new(),
        created_at: now,
        updated_at: now,
      },
    ));

    let mut indexes = Indexes {
      by_id: HashMap::new(),
      by_title: HashMap::new(),
      last_id: 1,
    };
    indexes.by_id.insert(1, lobby.clone());
    indexes.by_title.insert("public chat".to_string(), lobby);

    Self {
      inner: Arc::new(RwLock::new(indexes)),
      hash_cost,
    }
  }

  /// Validate, hash the credential, assign an id and start the room's broker.
  pub async fn add(&self, form: RoomForm) -> ApiResult<Arc<Room>> {
    let visibility = form.validate()?;
    let key = form.title.to_lowercase();

    if self.inner.read().await.by_title.contains_key(&key) {
      return Err(ApiError::with_field(ErrorCode::DuplicateRoom, "title"));
    }

    // Hash outside the lock; bcrypt is slow on purpose.
    let credential = match visibility {
      Visibility::Public => String::new(),
      _ => hash_credential(form.password, self.hash_cost).await?,
    };

    let mut indexes = self.inner.write().await;
    if indexes.by_title.contains_key(&key) {
      return Err(ApiError::with_field(ErrorCode::DuplicateRoom, "title"));
    }
    indexes.last_id += 1;
    let id = indexes.last_id;

    let now = Utc::now();
    let room = Arc::new(Room::new(
      id,
      RoomDetails {
        title: form.title,
        description: form.description,
        visibility,
        credential,
        created_at: now,
        updated_at: now,
      },
    ));
    indexes.by_id.insert(id, room.clone());
    indexes.by_title.insert(key, room.clone());
    drop(indexes);

    info!(room_id = id, %visibility, "created chat room");
    Ok(room)
  }

  /// Look a room up by id or title. Numeric identifiers try the id index first.
  pub async fn retrieve(&self, identifier: &str) -> ApiResult<Arc<Room>> {
    let indexes = self.inner.read().await;
    if let Ok(id) = identifier.parse::<RoomId>() {
      if let Some(room) = indexes.by_id.get(&id) {
        return Ok(room.clone());
      }
    }
    indexes
      .by_title
      .get(&identifier.to_lowercase())
      .cloned()
      .ok_or_else(|| ApiError::room_not_found(identifier))
  }

  pub async fn retrieve_id(&self, id: RoomId) -> ApiResult<Arc<Room>> {
    self
      .inner
      .read()
      .await
      .by_id
      .get(&id)
      .cloned()
      .ok_or_else(|| ApiError::room_not_found(&id.to_string()))
  }

  /// Replace title, description and visibility in place.
  ///
  /// The stored credential is kept and takes part in validation, so a room
  /// cannot move between public and protected through this call. Id and broker
  /// are untouched.
  pub async fn update(&self, identifier: &str, mut form: RoomForm) -> ApiResult<Arc<Room>> {
    let room = self.retrieve(identifier).await?;

    let mut indexes = self.inner.write().await;
    if !indexes.by_id.contains_key(&room.id) {
      return Err(ApiError::room_not_found(identifier));
    }

    let mut details = room.details.write().await;
    form.password = details.credential.clone();
    let visibility = form.validate()?;

    let old_key = details.title.to_lowercase();
    let new_key = form.title.to_lowercase();
    if new_key != old_key && indexes.by_title.contains_key(&new_key) {
      return Err(ApiError::with_field(ErrorCode::DuplicateRoom, "title"));
    }

    details.title = form.title;
    details.description = form.description;
    details.visibility = visibility;
    details.updated_at = Utc::now();
    drop(details);

    if new_key != old_key {
      indexes.by_title.remove(&old_key);
      indexes.by_title.insert(new_key, room.clone());
    }
    drop(indexes);

    info!(room_id = room.id, "updated chat room");
    Ok(room)
  }

  /// Remove the room from both indexes, then stop its broker and wait for it.
  pub async fn delete(&self, room: &Arc<Room>) -> ApiResult<()> {
    {
      let mut indexes = self.inner.write().await;
      if indexes.by_id.remove(&room.id).is_none() {
        return Err(ApiError::room_not_found(&room.id.to_string()));
      }
      let key = room.title().await.to_lowercase();
      indexes.by_title.remove(&key);
    }

    room.broker.shutdown().await;
    info!(room_id = room.id, "deleted chat room");
    Ok(())
  }

  /// All rooms that are not hidden, ordered by id.
  pub async fn list(&self) -> Vec<Arc<Room>> {
    let mut rooms: Vec<Arc<Room>> = self.inner.read().await.by_id.values().cloned().collect();
    rooms.sort_by_key(|room| room.id);

    let mut listed = Vec::with_capacity(rooms.len());
    for room in rooms {
      if room.visibility().await != Visibility::Hidden {
        listed.push(room);
      }
    }
    listed
  }

  #[cfg(test)]
  async fn len(&self) -> usize {
    self.inner.read().await.by_id.len()
  }
}

impl Default for RoomRegistry {
  fn default() -> Self {
    Self::new()
  }
}

async fn hash_credential(password: String, cost: u32) -> ApiResult<String> {
  let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
    .await
    .map_err(|_| ApiError::with_field(ErrorCode::RoomUnauthorized, "secret"))?;
  hashed.map_err(|_| ApiError::with_field(ErrorCode::RoomUnauthorized, "secret"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::ClientId;

  fn registry() -> RoomRegistry {
    RoomRegistry::with_hash_cost(TEST_HASH_COST)
  }

  #[tokio::test]
  async fn starts_with_default_public_room() {
    let registry = registry();
    let lobby = registry.retrieve("1").await.unwrap();
    assert_eq!(lobby.title().await, "Public Chat");
    assert!(lobby.is_public().await);
    assert!(lobby.broker().is_running());
    assert_eq!(registry.len().await, 1);
  }

  #[tokio::test]
  async fn retrieve_by_id_and_any_case_title() {
    let registry = registry();
    let room = registry
      .add(RoomForm::new("Lobby", "public").description("say hi"))
      .await
      .unwrap();

    let by_id = registry.retrieve(&room.id().to_string()).await.unwrap();
    let by_title = registry.retrieve("lOBBY").await.unwrap();
    assert!(Arc::ptr_eq(&room, &by_id));
    assert!(Arc::ptr_eq(&room, &by_title));
    assert!(Arc::ptr_eq(&room, &registry.retrieve_id(room.id()).await.unwrap()));

    let err = registry.retrieve("nowhere").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RoomNotFound);
    assert_eq!(registry.retrieve("99").await.unwrap_err().code, ErrorCode::RoomNotFound);
  }

  #[tokio::test]
  async fn numeric_title_falls_back_to_title_index() {
    let registry = registry();
    let room = registry.add(RoomForm::new("2048", "public")).await.unwrap();
    assert_eq!(room.id(), 2);
    // "2048" is not an id, so the title index answers.
    assert!(Arc::ptr_eq(&room, &registry.retrieve("2048").await.unwrap()));
  }

  #[tokio::test]
  async fn duplicate_title_is_rejected_and_registry_unchanged() {
    let registry = registry();
    registry.add(RoomForm::new("Lobby", "public")).await.unwrap();
    let before = registry.len().await;

    let err = registry.add(RoomForm::new("LOBBY", "public")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateRoom);
    assert_eq!(err.field.as_deref(), Some("title"));
    assert_eq!(registry.len().await, before);

    let next = registry.add(RoomForm::new("Other", "public")).await.unwrap();
    assert_eq!(next.id(), 3);
  }

  #[tokio::test]
  async fn validation_rules() {
    let cases = [
      (RoomForm::new("x", "public"), "title"),
      (RoomForm::new(&"t".repeat(71), "public"), "title"),
      (RoomForm::new("ok", "public").description(&"d".repeat(71)), "description"),
      (RoomForm::new("ok", "secret-club"), "visibility"),
      (RoomForm::new("ok", "private").password("short"), "password"),
      (RoomForm::new("ok", "hidden"), "password"),
      (RoomForm::new("ok", "public").password("longpass1"), "visibility"),
      // 36 characters, 72 bytes.
      (RoomForm::new(&"ñ".repeat(36), "public"), "title"),
    ];
    for (form, field) in cases {
      let err = form.validate().unwrap_err();
      assert_eq!(err.code, ErrorCode::InvalidContent);
      assert_eq!(err.field.as_deref(), Some(field), "{form:?}");
    }

    assert_eq!(RoomForm::new("ok", "PUBLIC").validate().unwrap(), Visibility::Public);
    assert_eq!(
      RoomForm::new("ok", "Private").password("longpass1").validate().unwrap(),
      Visibility::Private
    );
    // Four characters, eight bytes.
    assert_eq!(
      RoomForm::new("ok", "private").password("ññññ").validate().unwrap(),
      Visibility::Private
    );
  }

  #[tokio::test]
  async fn credentials_are_hashed_for_protected_rooms_only() {
    let registry = registry();
    let public = registry.add(RoomForm::new("Open", "public")).await.unwrap();
    assert!(public.credential().await.is_empty());

    let private = registry
      .add(RoomForm::new("Club", "private").password("longpass1"))
      .await
      .unwrap();
    let hash = private.credential().await;
    assert_ne!(hash, "longpass1");
    assert!(bcrypt::verify("longpass1", &hash).unwrap());
  }

  #[tokio::test]
  async fn update_keeps_identity_and_rekeys_title() {
    let registry = registry();
    let room = registry
      .add(RoomForm::new("Club", "private").password("longpass1"))
      .await
      .unwrap();
    let created = room.details().await;

    let updated = registry
      .update("club", RoomForm::new("Night Club", "hidden").description("after hours"))
      .await
      .unwrap();
    assert!(Arc::ptr_eq(&room, &updated));

    let details = room.details().await;
    assert_eq!(details.title, "Night Club");
    assert_eq!(details.visibility, Visibility::Hidden);
    assert_eq!(details.credential, created.credential);
    assert!(details.updated_at >= created.updated_at);
    assert_eq!(details.created_at, created.created_at);

    assert!(registry.retrieve("night club").await.is_ok());
    assert_eq!(registry.retrieve("club").await.unwrap_err().code, ErrorCode::RoomNotFound);
  }

  #[tokio::test]
  async fn update_cannot_cross_public_boundary_or_steal_title() {
    let registry = registry();
    let private = registry
      .add(RoomForm::new("Club", "private").password("longpass1"))
      .await
      .unwrap();
    registry.add(RoomForm::new("Lobby", "public")).await.unwrap();

    let err = registry
      .update(&private.id().to_string(), RoomForm::new("Club", "public"))
      .await
      .unwrap_err();
    assert_eq!(err.field.as_deref(), Some("visibility"));

    let err = registry.update("lobby", RoomForm::new("Lobby", "private")).await.unwrap_err();
    assert_eq!(err.field.as_deref(), Some("password"));

    let err = registry.update("lobby", RoomForm::new("club", "public")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateRoom);
  }

  #[tokio::test]
  async fn delete_stops_broker_and_never_reuses_ids() {
    let registry = registry();
    let first = registry.add(RoomForm::new("First", "public")).await.unwrap();
    let second = registry.add(RoomForm::new("Second", "public")).await.unwrap();

    registry.delete(&second).await.unwrap();
    assert!(!second.broker().is_running());
    assert!(registry.retrieve("second").await.is_err());
    assert!(registry.retrieve(&second.id().to_string()).await.is_err());

    let third = registry.add(RoomForm::new("Third", "public")).await.unwrap();
    assert!(third.id() > second.id());
    assert!(third.id() > first.id());

    let err = registry.delete(&second).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RoomNotFound);
  }

  #[tokio::test]
  async fn list_hides_hidden_rooms() {
    let registry = registry();
    registry.add(RoomForm::new("Open", "public")).await.unwrap();
    registry
      .add(RoomForm::new("Club", "private").password("longpass1"))
      .await
      .unwrap();
    registry
      .add(RoomForm::new("Secret", "hidden").password("longpass1"))
      .await
      .unwrap();

    let mut titles = Vec::new();
    for room in registry.list().await {
      titles.push(room.title().await);
    }
    assert_eq!(titles, vec!["Public Chat", "Open", "Club"]);
  }

  #[tokio::test]
  async fn concurrent_adds_get_unique_ids() {
    let registry = registry();
    let mut handles = Vec::new();
    for i in 0..20 {
      let registry = registry.clone();
      handles.push(tokio::spawn(async move {
        registry.add(RoomForm::new(&format!("room {i}"), "public")).await
      }));
    }

    let mut ids = Vec::new();
    for handle in handles {
      ids.push(handle.await.unwrap().unwrap().id());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(registry.len().await, 21);
  }

  #[tokio::test]
  async fn concurrent_duplicate_adds_create_one_room() {
    let registry = registry();
    let mut handles = Vec::new();
    for _ in 0..10 {
      let registry = registry.clone();
      handles.push(tokio::spawn(async move {
        registry
          .add(RoomForm::new("Race", "private").password("longpass1"))
          .await
      }));
    }

    let mut created = 0;
    for handle in handles {
      match handle.await.unwrap() {
        Ok(_) => created += 1,
        Err(err) => assert_eq!(err.code, ErrorCode::DuplicateRoom),
      }
    }
    assert_eq!(created, 1);
  }

  #[tokio::test]
  async fn membership_is_case_insensitive() {
    let registry = registry();
    let room = registry.retrieve("1").await.unwrap();

    let alice = Arc::new(Client::new(ClientId::next()));
    alice.bind("Alice", "red").unwrap();
    room.add_client("Alice", alice.clone()).await.unwrap();

    let impostor = Arc::new(Client::new(ClientId::next()));
    impostor.bind("ALICE", "blue").unwrap();
    let err = room.add_client("ALICE", impostor.clone()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateUsername);

    // Only the owning connection can release the name.
    let err = room.remove_client("alice", &impostor).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UserNotFound);
    assert!(room.has_member("alice").await);

    room.remove_client("alice", &alice).await.unwrap();
    assert!(!room.has_member("alice").await);
    assert!(room.members().await.is_empty());

    let err = room.remove_client("alice", &alice).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UserNotFound);
  }

  #[tokio::test]
  async fn view_serializes_expected_fields() {
    let registry = registry();
    let room = registry.retrieve("1").await.unwrap();
    let alice = Arc::new(Client::new(ClientId::next()));
    alice.bind("alice", "red").unwrap();
    room.add_client("alice", alice).await.unwrap();

    let json = serde_json::to_value(room.view().await).unwrap();
    assert_eq!(json["title"], "Public Chat");
    assert_eq!(json["visibility"], "public");
    assert_eq!(json["id"], 1);
    assert!(json["createdAt"].is_string());
    assert!(json["updatedAt"].is_string());
    assert_eq!(json["users"][0]["username"], "alice");
    assert!(json.get("password").is_none());
    assert!(json.get("credential").is_none());
  }
}

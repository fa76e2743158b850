//! Reader and writer tasks bridging one WebSocket connection to its room.
//!
//! Every connection gets exactly one reader and one writer. The reader is the
//! only task that pulls frames off the socket; the writer is the only task that
//! pushes frames onto it. They meet the rest of the system through the room's
//! [`Broker`](crate::broker::Broker): the writer drains the queue the broker
//! fills, and the reader publishes to the broker.
//!
//! Both pumps are generic over `Stream`/`Sink` so they run unchanged on a split
//! axum `WebSocket` and on in-memory channels in tests.

use axum::{body::Bytes, extract::ws::Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
  sync::mpsc,
  task::JoinHandle,
  time::{interval_at, timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
  broker::{ClientId, Payload},
  client::Client,
  error::BrokerError,
  event::{ChatEvent, EventKind},
  room::Room,
};

/// Connection timings and limits.
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
  /// Largest inbound frame accepted.
  pub max_message_size: usize,
  /// Read deadline, renewed on every pong.
  pub pong_wait: Duration,
  /// Ping interval. Must be shorter than `pong_wait`.
  pub ping_period: Duration,
  /// Time allowed for a single write.
  pub write_wait: Duration,
  /// Delay before join/leave notices are published.
  pub notice_delay: Duration,
  /// Capacity of each connection's outbound queue.
  pub queue_capacity: usize,
}

impl Default for PumpSettings {
  fn default() -> Self {
    let pong_wait = Duration::from_secs(60);
    Self {
      max_message_size: 512,
      pong_wait,
      ping_period: pong_wait * 9 / 10,
      write_wait: Duration::from_secs(10),
      notice_delay: Duration::from_millis(200),
      queue_capacity: 256,
    }
  }
}

/// A connection attached to a room.
#[derive(Clone)]
pub struct Session {
  pub room: Arc<Room>,
  pub client: Arc<Client>,
}

/// Create a client for `room` and register its outbound queue with the broker.
///
/// Registration is queued on the broker before this returns, so anything the
/// reader publishes afterwards is processed with this client already present.
pub async fn connect(
  room: Arc<Room>,
  settings: &PumpSettings,
) -> Result<(Session, mpsc::Receiver<Payload>), BrokerError> {
  let client = Arc::new(Client::new(ClientId::next()));
  let (tx, rx) = mpsc::channel(settings.queue_capacity);
  room.broker().register(client.id(), tx).await?;
  info!(room_id = room.id(), client = %client.id(), "connection attached");
  Ok((Session { room, client }, rx))
}

/// Why a reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
  /// Peer sent a close frame.
  Closed,
  /// Stream ended without a close frame.
  Eof,
  /// No pong within the read deadline.
  TimedOut,
  /// Frame over the size limit.
  TooLarge(usize),
  /// Transport error.
  Transport(String),
}

impl Exit {
  pub fn is_abnormal(&self) -> bool {
    !matches!(self, Exit::Closed)
  }
}

impl fmt::Display for Exit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Exit::Closed => f.write_str("closed by peer"),
      Exit::Eof => f.write_str("unexpected end of stream"),
      Exit::TimedOut => f.write_str("read deadline expired"),
      Exit::TooLarge(len) => write!(f, "frame of {len} bytes over limit"),
      Exit::Transport(e) => write!(f, "transport error: {e}"),
    }
  }
}

/// Read frames until the connection ends, then detach the client from its room.
pub async fn read_pump<S>(mut stream: S, session: Session, settings: PumpSettings) -> Exit
where
  S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
  let mut deadline = Instant::now() + settings.pong_wait;

  let exit = loop {
    let frame = match timeout_at(deadline, stream.next()).await {
      Err(_) => break Exit::TimedOut,
      Ok(None) => break Exit::Eof,
      Ok(Some(Err(e))) => break Exit::Transport(e.to_string()),
      Ok(Some(Ok(frame))) => frame,
    };

    match frame {
      Message::Text(text) => {
        let raw = text.as_str();
        if raw.len() > settings.max_message_size {
          break Exit::TooLarge(raw.len());
        }
        handle_frame(raw.as_bytes(), &session, &settings).await;
      }
      Message::Pong(_) => deadline = Instant::now() + settings.pong_wait,
      Message::Close(_) => break Exit::Closed,
      Message::Ping(_) => {}
      Message::Binary(_) => warn!(client = %session.client.id(), "ignoring binary frame"),
    }
  };

  detach(&session, &exit, &settings).await;
  exit
}

async fn handle_frame(data: &[u8], session: &Session, settings: &PumpSettings) {
  let Session { room, client } = session;

  let mut event = match ChatEvent::decode(data) {
    Ok(event) => event,
    Err(e) => {
      warn!(room_id = room.id(), client = %client.id(), "dropping malformed event: {}", e);
      return;
    }
  };
  event.room_id = room.id();
  event.timestamp = Some(chrono::Utc::now());

  match event.event_type {
    EventKind::Subscribe => subscribe(event, session, settings).await,
    EventKind::Unsubscribe => unsubscribe(event, session, settings).await,
    EventKind::Broadcast => {
      client.touch();
      publish(room, &event).await;
    }
    EventKind::Unknown => warn!(room_id = room.id(), client = %client.id(), "unknown event type"),
  }
}

async fn subscribe(event: ChatEvent, session: &Session, settings: &PumpSettings) {
  let Session { room, client } = session;

  if let Err(e) = client.may_bind(&event.user) {
    warn!(room_id = room.id(), client = %client.id(), "cannot subscribe as {}: {}", event.user, e);
    return;
  }
  // The profile only changes once the room has accepted the name.
  if let Err(e) = room.add_client(&event.user, client.clone()).await {
    warn!(room_id = room.id(), client = %client.id(), "error adding client: {}", e);
    return;
  }
  if let Err(e) = client.bind(&event.user, &event.color) {
    warn!(room_id = room.id(), client = %client.id(), "cannot subscribe as {}: {}", event.user, e);
    let _ = room.remove_client(&event.user, client).await;
    return;
  }
  client.set_subscribed(true);
  info!(room_id = room.id(), user = %event.user, "user joined");

  let notice = ChatEvent::joined(&event.user, &event.color, room.id());
  announce_later(room.clone(), notice, settings.notice_delay);
}

async fn unsubscribe(event: ChatEvent, session: &Session, settings: &PumpSettings) {
  let Session { room, client } = session;
  client.touch();

  if let Err(e) = room.remove_client(&event.user, client).await {
    warn!(room_id = room.id(), client = %client.id(), "error removing client: {}", e);
    return;
  }
  client.set_subscribed(false);
  info!(room_id = room.id(), user = %event.user, "user left");

  let notice = ChatEvent::left(&event.user, &client.color(), room.id());
  announce_later(room.clone(), notice, settings.notice_delay);
}

/// Publish `event` after `delay` on its own task.
fn announce_later(room: Arc<Room>, event: ChatEvent, delay: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    tokio::time::sleep(delay).await;
    publish(&room, &event).await;
  })
}

async fn publish(room: &Room, event: &ChatEvent) {
  let payload = match event.encode() {
    Ok(json) => Payload::from(json),
    Err(e) => {
      warn!(room_id = room.id(), "failed to encode event: {}", e);
      return;
    }
  };
  if let Err(e) = room.broker().notify(payload).await {
    debug!(room_id = room.id(), "event not published: {}", e);
  }
}

/// Release everything the connection holds in its room.
async fn detach(session: &Session, exit: &Exit, settings: &PumpSettings) {
  let Session { room, client } = session;

  // The room may already be gone, in which case its broker dropped us.
  let _ = room.broker().deregister(client.id()).await;

  if client.is_subscribed() {
    let username = client.username();
    let _ = room.remove_client(&username, client).await;
    client.set_subscribed(false);
    let notice = ChatEvent::left(&username, &client.color(), room.id());
    announce_later(room.clone(), notice, settings.notice_delay);
  }

  if exit.is_abnormal() {
    warn!(room_id = room.id(), client = %client.id(), "connection lost: {}", exit);
  } else {
    info!(room_id = room.id(), client = %client.id(), "connection closed");
  }
}

/// Drain the outbound queue onto the socket until the broker closes it.
///
/// Events already waiting when a frame is written go into that same frame,
/// separated by `\n`. While the queue is idle a ping goes out every
/// `ping_period`. A failed or timed-out write ends the task.
pub async fn write_pump<S>(mut sink: S, mut queue: mpsc::Receiver<Payload>, settings: PumpSettings)
where
  S: Sink<Message> + Unpin,
  S::Error: fmt::Display,
{
  let mut ticker = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

  loop {
    let frame = tokio::select! {
      biased;
      item = queue.recv() => match item {
        Some(first) => {
          let mut text = String::from(&*first);
          for _ in 0..queue.len() {
            match queue.try_recv() {
              Ok(next) => {
                text.push('\n');
                text.push_str(&next);
              }
              Err(_) => break,
            }
          }
          Message::Text(text.into())
        }
        None => {
          let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
          debug!("outbound queue closed, writer done");
          return;
        }
      },
      _ = ticker.tick() => Message::Ping(Bytes::new()),
    };

    match timeout(settings.write_wait, sink.send(frame)).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        debug!("write failed: {}", e);
        return;
      }
      Err(_) => {
        warn!("write timed out after {:?}", settings.write_wait);
        return;
      }
    }
  }
}

//! Per-room fan-out broker.
//!
//! Each room owns exactly one [`Broker`]. The broker runs a single task that
//! processes register, deregister and notify commands one at a time, so the
//! set of live client queues is only ever touched from that task and needs no
//! lock.
//!
//! Delivery is best-effort. A notify tries every registered queue; a queue
//! that stays full for the whole patience window misses that one event, and a
//! queue whose receiver is gone is dropped from the set.
//!
//! ## Example Usage
//! ```no_run
//! use neochat::broker::{Broker, ClientId};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Broker::start(1);
//!     let (tx, mut rx) = mpsc::channel(16);
//!     let id = ClientId::next();
//!
//!     broker.register(id, tx).await.unwrap();
//!     broker.notify("hello".into()).await.unwrap();
//!     assert_eq!(&*rx.recv().await.unwrap(), "hello");
//!
//!     broker.shutdown().await;
//! }
//! ```

use futures::future::join_all;
use std::{
  collections::HashMap,
  fmt,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};
use tokio::{
  sync::{
    mpsc::{
      self,
      error::{SendTimeoutError, TrySendError},
    },
    oneshot,
  },
  task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{error::BrokerError, room::RoomId};

/// How long a notify waits on a full client queue before skipping that client.
pub const PATIENCE: Duration = Duration::from_secs(1);

const COMMAND_BUFFER: usize = 256;

/// An encoded event, shared between every queue it is pushed to.
pub type Payload = Arc<str>;

/// Outbound queue of one connection.
pub type ClientQueue = mpsc::Sender<Payload>;

/// Process-unique identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
  pub fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

enum Command {
  Register { id: ClientId, queue: ClientQueue },
  Deregister(ClientId),
  Notify(Payload),
  Count(oneshot::Sender<usize>),
}

struct BrokerTask {
  handle: JoinHandle<()>,
  stop_tx: oneshot::Sender<()>, // signals graceful shutdown
}

/// Handle to a room's running broker task.
pub struct Broker {
  room_id: RoomId,
  commands: mpsc::Sender<Command>,
  task: Mutex<Option<BrokerTask>>,
}

impl Broker {
  /// Spawn the broker task for a room with the default patience window.
  pub fn start(room_id: RoomId) -> Self {
    Self::with_patience(room_id, PATIENCE)
  }

  /// Spawn the broker task with a custom patience window.
  pub fn with_patience(room_id: RoomId, patience: Duration) -> Self {
    let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
    let (stop_tx, stop_rx) = oneshot::channel();

    let state = BrokerState {
      room_id,
      patience,
      clients: HashMap::new(),
    };
    let handle = tokio::spawn(state.run(rx, stop_rx));

    Self {
      room_id,
      commands,
      task: Mutex::new(Some(BrokerTask { handle, stop_tx })),
    }
  }

  /// Add a client queue to the live set.
  pub async fn register(&self, id: ClientId, queue: ClientQueue) -> Result<(), BrokerError> {
    self.send(Command::Register { id, queue }).await
  }

  /// Remove a client. Its queue is dropped, which ends its writer.
  pub async fn deregister(&self, id: ClientId) -> Result<(), BrokerError> {
    self.send(Command::Deregister(id)).await
  }

  /// Fan an encoded event out to every registered client.
  pub async fn notify(&self, payload: Payload) -> Result<(), BrokerError> {
    self.send(Command::Notify(payload)).await
  }

  /// Number of currently registered clients.
  pub async fn client_count(&self) -> Result<usize, BrokerError> {
    let (tx, rx) = oneshot::channel();
    self.send(Command::Count(tx)).await?;
    rx.await.map_err(|_| BrokerError::Stopped(self.room_id))
  }

  pub fn is_running(&self) -> bool {
    self
      .task
      .lock()
      .map(|task| task.as_ref().is_some_and(|t| !t.handle.is_finished()))
      .unwrap_or(false)
  }

  /// Stop the task after it drains already queued commands, and wait for it.
  ///
  /// Every client queue is dropped on the way out. Calling this twice is a no-op.
  pub async fn shutdown(&self) {
    let task = match self.task.lock() {
      Ok(mut guard) => guard.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(BrokerTask { handle, stop_tx }) = task {
      let _ = stop_tx.send(());
      if let Err(e) = handle.await {
        warn!(room_id = self.room_id, "broker task ended abnormally: {}", e);
      }
    }
  }

  async fn send(&self, command: Command) -> Result<(), BrokerError> {
    self
      .commands
      .send(command)
      .await
      .map_err(|_| BrokerError::Stopped(self.room_id))
  }
}

impl Drop for Broker {
  fn drop(&mut self) {
    if let Ok(mut guard) = self.task.lock() {
      if let Some(task) = guard.take() {
        task.handle.abort();
      }
    }
  }
}

/// State owned by the broker task.
struct BrokerState {
  room_id: RoomId,
  patience: Duration,
  clients: HashMap<ClientId, ClientQueue>,
}

impl BrokerState {
  async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut stop_rx: oneshot::Receiver<()>) {
    loop {
      tokio::select! {
        biased;
        // Checked first so a busy command queue cannot starve shutdown.
        _ = &mut stop_rx => {
          // Refuse new commands, finish the ones already queued.
          rx.close();
          while let Some(command) = rx.recv().await {
            self.apply(command).await;
          }
          break;
        }
        command = rx.recv() => match command {
          Some(command) => self.apply(command).await,
          None => break,
        },
      }
    }
    debug!(room_id = self.room_id, clients = self.clients.len(), "broker stopped");
  }

  async fn apply(&mut self, command: Command) {
    match command {
      Command::Register { id, queue } => {
        self.clients.insert(id, queue);
        debug!(room_id = self.room_id, %id, "client added. {} registered clients", self.clients.len());
      }
      Command::Deregister(id) => {
        if self.clients.remove(&id).is_some() {
          debug!(room_id = self.room_id, %id, "removed client. {} registered clients", self.clients.len());
        }
      }
      Command::Notify(payload) => self.fan_out(payload).await,
      Command::Count(reply) => {
        let _ = reply.send(self.clients.len());
      }
    }
  }

  async fn fan_out(&mut self, payload: Payload) {
    let mut waiting = Vec::new();
    let mut gone = Vec::new();

    for (id, queue) in &self.clients {
      match queue.try_send(payload.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(payload)) => waiting.push((*id, queue.clone(), payload)),
        Err(TrySendError::Closed(_)) => gone.push(*id),
      }
    }

    // Full queues share one patience window instead of paying it in turn.
    let patience = self.patience;
    let outcomes = join_all(waiting.into_iter().map(|(id, queue, payload)| async move {
      (id, queue.send_timeout(payload, patience).await)
    }))
    .await;

    for (id, outcome) in outcomes {
      match outcome {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(_)) => {
          warn!(room_id = self.room_id, %id, "skipping slow client");
        }
        Err(SendTimeoutError::Closed(_)) => gone.push(id),
      }
    }

    for id in gone {
      self.clients.remove(&id);
      debug!(room_id = self.room_id, %id, "deleting unreachable client");
    }
  }
}

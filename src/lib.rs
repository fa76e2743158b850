//! Real-time chat rooms over WebSockets.
//!
//! Rooms live in a [`room::RoomRegistry`]. Each room runs its own
//! [`broker::Broker`] task that fans events out to connected clients, and each
//! connection is served by a reader/writer pair from [`pump`]. Protected rooms
//! are entered with room-scoped tokens from [`auth::AuthTokenService`].

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod pump;
pub mod room;
pub mod server;

use anyhow::Context;
use axum::{
  http::{
    header::{AUTHORIZATION, CONTENT_TYPE, SEC_WEBSOCKET_PROTOCOL},
    Method,
  },
  Router,
};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::{
  compression::CompressionLayer,
  cors::{Any, CorsLayer},
  services::ServeDir,
  trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::Config;
pub use server::AppState;

pub fn app(state: AppState, config: &Config) -> Router {
  let cors = CorsLayer::new()
    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::PUT])
    .allow_origin(Any)
    .allow_headers([CONTENT_TYPE, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL]);

  let mut app = server::router(state);
  if let Some(dir) = &config.static_dir {
    app = app.nest_service("/static", ServeDir::new(dir));
  }

  app
    .layer(cors)
    .layer(TraceLayer::new_for_http())
    .layer(CompressionLayer::new())
}

pub async fn run() -> anyhow::Result<()> {
  dotenv().ok();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!(
            "{}=debug,tower_http=debug,axum::rejection=trace",
            env!("CARGO_CRATE_NAME")
          ).into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let config = Config::from_env()?;
  let state = AppState::new(&config);
  let app = app(state, &config);

  let listener = TcpListener::bind(&config.address)
    .await
    .with_context(|| format!("failed to bind {}", config.address))?;
  info!("listening on {}", config.address);

  axum::serve(listener, app).await.context("server error")?;
  Ok(())
}

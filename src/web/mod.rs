//! Presenter: relays aggregated summaries to live WebSocket subscribers.

mod feed;
mod handlers;

pub use feed::*;
pub use handlers::*;

use crate::broker::{BrokerError, SharedChannel};
use crate::config::{BrokerConfig, PresenterConfig};
use crate::model::{decode, EndpointSnapshot};

use axum::{routing::get, Router};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Presenter error types.
#[derive(Error, Debug)]
pub enum PresenterError {
    #[error("web server error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub feed: Feed,
    pub write_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Serves the live feed and keeps it supplied from the summaries topic.
pub struct Presenter {
    config: PresenterConfig,
    feed: Feed,
}

impl Presenter {
    pub fn new(config: PresenterConfig) -> Self {
        let feed = Feed::new(config.subscriber_buffer);
        Self { config, feed }
    }

    pub fn feed(&self) -> Feed {
        self.feed.clone()
    }

    /// Build the router with all routes.
    pub fn routes(&self, cancel: CancellationToken) -> Router {
        let state = AppState {
            feed: self.feed.clone(),
            write_timeout: self.config.write_timeout(),
            cancel,
        };
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/ws_stats", get(handlers::handle_ws_stats))
            .route("/healthz", get(handlers::handle_healthz))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve subscribers and relay summaries until cancelled.
    pub async fn run(
        self,
        channel: SharedChannel,
        broker: &BrokerConfig,
        cancel: CancellationToken,
    ) -> Result<(), PresenterError> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("Web server listening on {}", listener.local_addr()?);

        let router = self.routes(cancel.clone());
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let shutdown = server_cancel.clone();
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = &result {
                tracing::error!("Web server failed: {}", e);
                server_cancel.cancel();
            }
            result
        });

        let relayed = relay(&channel, broker, &self.feed, &cancel).await;
        if let Err(e) = &relayed {
            tracing::error!("Presenter stopped: {}", e);
            cancel.cancel();
        }
        channel.close().await;

        let served = match server.await {
            Ok(result) => result.map_err(PresenterError::from),
            Err(e) => {
                tracing::error!("Web server task panicked: {}", e);
                Ok(())
            }
        };

        relayed?;
        served
    }
}

/// Forward every snapshot from the summaries topic to the feed, in order.
async fn relay(
    channel: &SharedChannel,
    broker: &BrokerConfig,
    feed: &Feed,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    let mut summaries = channel
        .subscribe(&broker.summaries_topic, broker.prefetch)
        .await?;
    tracing::info!("Presenter consuming {}", broker.summaries_topic);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = summaries.next() => {
                let Some(payload) = next else {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(BrokerError::Disconnected(broker.summaries_topic.clone()));
                };

                if let Err(e) = decode::<EndpointSnapshot>(&payload) {
                    tracing::warn!("Presenter: dropping summary: {}", e);
                    continue;
                }
                // Valid JSON is valid UTF-8
                let Ok(text) = std::str::from_utf8(&payload) else {
                    tracing::warn!("Presenter: dropping non UTF-8 summary");
                    continue;
                };

                let delivered = feed.publish(Arc::from(text));
                tracing::debug!("Relayed summary to {} subscribers", delivered);
            }
        }
    }
}

//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Json},
};
use futures::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Live stats stream
// ============================================================================

/// Upgrade to a WebSocket streaming every aggregated summary as a text frame.
pub async fn handle_ws_stats(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_summaries(socket, state))
}

async fn stream_summaries(socket: WebSocket, state: AppState) {
    let mut summaries = state.feed.subscribe();
    let (mut sender, mut receiver) = socket.split();

    tracing::debug!("Subscriber connected ({} live)", state.feed.subscriber_count());

    // Nothing is expected from the client; reading only detects hang-ups
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!("Subscriber receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                if let Err(e) = send_within(&mut sender, Message::Close(None), state.write_timeout).await {
                    tracing::debug!("Subscriber missed close frame: {}", e);
                }
                break;
            }
            _ = &mut recv_task => {
                tracing::debug!("Subscriber disconnected");
                break;
            }
            next = summaries.recv() => match next {
                Ok(summary) => {
                    let frame = Message::Text(summary.to_string().into());
                    if let Err(e) = send_within(&mut sender, frame, state.write_timeout).await {
                        tracing::warn!("Dropping subscriber: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber lagged, skipped {} summaries", n);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    recv_task.abort();
}

#[derive(Error, Debug)]
enum WriteError {
    #[error("write failed: {0}")]
    Failed(String),
    #[error("write blocked for more than {0:?}")]
    TimedOut(Duration),
}

/// Send one frame, giving up after `limit`.
async fn send_within<S>(sender: &mut S, frame: Message, limit: Duration) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(limit, sender.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Failed(e.to_string())),
        Err(_) => Err(WriteError::TimedOut(limit)),
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "subscribers": state.feed.subscriber_count(),
    }))
}

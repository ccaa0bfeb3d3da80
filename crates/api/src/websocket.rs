// WebSocket live feed: one topic subscription per connection

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use marketstream_models::{Result, SymbolUniverse, Topic};
use marketstream_stream::{Broadcaster, Subscription};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    pub topic: Option<String>,
}

/// Parses a topic name and checks that a symbol topic names a known symbol.
/// No topic means `market-data.all`. Symbols match case-insensitively, as on
/// the snapshot route.
pub fn resolve_topic(raw: Option<&str>, universe: &SymbolUniverse) -> Result<Topic> {
    let topic = match raw.map(str::trim) {
        None | Some("") => Topic::All,
        Some(raw) => match raw.parse()? {
            Topic::Symbol(symbol) => Topic::Symbol(symbol.to_uppercase()),
            Topic::All => Topic::All,
        },
    };

    if let Topic::Symbol(symbol) = &topic {
        universe.require(symbol)?;
    }
    Ok(topic)
}

pub async fn live_feed(
    ws: WebSocketUpgrade,
    Query(params): Query<FeedParams>,
    State(state): State<AppState>,
) -> Response {
    let topic = match resolve_topic(params.topic.as_deref(), &state.universe) {
        Ok(topic) => topic,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| serve_feed(socket, state.broadcaster, state.universe, topic))
}

async fn serve_feed(socket: WebSocket, broadcaster: Arc<Broadcaster>, universe: Arc<SymbolUniverse>, topic: Topic) {
    let session = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = broadcaster.subscribe(topic);
    info!("🔌 Feed client {} connected to {}", session, subscription.topic());

    loop {
        tokio::select! {
            next = subscription.recv() => {
                let Some(snapshot) = next else {
                    // Broadcaster shut down
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let payload = match serde_json::to_string(snapshot.as_ref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("⚠️ Failed to encode snapshot for {}: {}", session, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = switch_topic(&broadcaster, &universe, &mut subscription, &text);
                    if sender.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    let missed = subscription.missed();
    subscription.unsubscribe();
    info!("👋 Feed client {} disconnected ({} snapshots skipped)", session, missed);
}

fn switch_topic(
    broadcaster: &Arc<Broadcaster>,
    universe: &SymbolUniverse,
    subscription: &mut Subscription,
    requested: &str,
) -> String {
    match resolve_topic(Some(requested), universe) {
        Ok(topic) => {
            debug!("Switching feed from {} to {}", subscription.topic(), topic);
            *subscription = broadcaster.subscribe(topic);
            serde_json::json!({ "subscribed": subscription.topic() }).to_string()
        }
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    }
}

use crate::auth::{authenticate_device, jwt::verify_token};
use crate::error::{AppError, AppResult};
use crate::models::User;
use crate::services::access::owned_device;
use crate::services::notifications::{DeviceEvent, Subscription};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use diesel::prelude::*;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct SubscribeQuery {
    pub device_id: i32,
    /// A user session token, or the device's own api key.
    pub token: String,
}

// Server → client messages
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "subscribed")]
    Subscribed { device_id: i32 },
    #[serde(rename = "event")]
    Event { event: DeviceEvent },
    #[serde(rename = "pong")]
    Pong,
}

// Client → server messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
}

/// Accepts the owner's session token (or an admin's) or the device api key.
fn authorize(state: &AppState, query: &SubscribeQuery) -> AppResult<()> {
    use crate::schema::users::dsl;

    let mut conn = state.db.get()?;

    if let Ok(claims) = verify_token(&query.token, &state.config.jwt.secret) {
        let user = dsl::users
            .filter(dsl::id.eq(claims.user_id))
            .select(User::as_select())
            .first::<User>(&mut conn)
            .optional()?
            .ok_or(AppError::Unauthorized)?;
        owned_device(&mut conn, &user, query.device_id)?;
        return Ok(());
    }

    let device = authenticate_device(&mut conn, &query.token)?;
    if device.id != query.device_id {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    authorize(&state, &query)?;

    let subscription = state.notifications.subscribe(query.device_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, subscription)))
}

async fn handle_socket(socket: WebSocket, state: AppState, subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();

    let Subscription {
        id: subscriber_id,
        device_id,
        events: mut event_rx,
    } = subscription;

    tracing::info!("Subscriber {} attached to device {}", subscriber_id, device_id);
    let _ = tx.send(ServerMessage::Subscribed { device_id });

    // Forward queued replies and device events to the socket
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = rx.recv() => msg,
                Some(event) = event_rx.recv() => ServerMessage::Event { event },
                else => break,
            };

            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode websocket message: {}", e),
            }
        }
    });

    // Handle incoming messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        let _ = tx.send(ServerMessage::Pong);
                    }
                    Err(e) => tracing::debug!("Ignoring websocket message: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.notifications.unsubscribe(device_id, subscriber_id);
    tracing::info!("Subscriber {} detached from device {}", subscriber_id, device_id);
}

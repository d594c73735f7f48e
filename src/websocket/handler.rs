use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::types::{ClientMessage, ServerMessage};
use crate::AppState;

/// WebSocket upgrade handler for dashboard clients.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let client_id = state.room_manager.register(tx);
    info!("Dashboard client connected: {}", client_id);

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Relay market updates for symbols this client is subscribed to
    let mut updates = state.market_data.subscribe_updates();
    let update_room_manager = state.room_manager.clone();
    let update_task = tokio::spawn(async move {
        while let Ok(data) = updates.recv().await {
            let wanted = match update_room_manager.clients.get(&client_id) {
                Some(client) => client.symbols.contains(&data.symbol),
                None => break,
            };
            if !wanted {
                continue;
            }
            let msg = ServerMessage::MarketUpdate { data };
            if let (Ok(json), Some(client)) = (
                serde_json::to_string(&msg),
                update_room_manager.clients.get(&client_id),
            ) {
                let _ = client.tx.send(json);
            }
        }
    });

    // Relay risk alerts when this client opted in
    let mut alerts = state.monitoring.subscribe_alerts();
    let alert_room_manager = state.room_manager.clone();
    let alert_task = tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            let wanted = match alert_room_manager.clients.get(&client_id) {
                Some(client) => client.alerts,
                None => break,
            };
            if !wanted {
                continue;
            }
            let msg = ServerMessage::RiskAlert { data: alert };
            if let (Ok(json), Some(client)) = (
                serde_json::to_string(&msg),
                alert_room_manager.clients.get(&client_id),
            ) {
                let _ = client.tx.send(json);
            }
        }
    });

    // Handle incoming messages
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Message from {}: {}", client_id, text);
                handle_message(&state, client_id, &text);
            }
            Ok(Message::Close(_)) => {
                info!("Dashboard client disconnecting: {}", client_id);
                break;
            }
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by axum
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    // Clean up
    state.room_manager.unregister(client_id);
    send_task.abort();
    update_task.abort();
    alert_task.abort();
    info!("Dashboard client disconnected: {}", client_id);
}

fn handle_message(state: &AppState, client_id: Uuid, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_message(
                state,
                client_id,
                &ServerMessage::Error {
                    error: format!("invalid message: {}", e),
                },
            );
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { symbols } => {
            let subscribed = state.room_manager.subscribe(client_id, &symbols);
            debug!("Client {} subscribed to: {:?}", client_id, subscribed);

            // Send the current snapshot right away so dashboards render
            // without waiting for the next tick
            for symbol in &subscribed {
                if let Some(data) = state.market_data.get_market_data(symbol) {
                    send_message(state, client_id, &ServerMessage::MarketUpdate { data });
                }
            }

            send_message(
                state,
                client_id,
                &ServerMessage::Subscribed {
                    symbols: subscribed,
                },
            );
        }
        ClientMessage::Unsubscribe { symbols } => {
            let unsubscribed = state.room_manager.unsubscribe(client_id, &symbols);
            debug!("Client {} unsubscribed from: {:?}", client_id, unsubscribed);

            send_message(
                state,
                client_id,
                &ServerMessage::Unsubscribed {
                    symbols: unsubscribed,
                },
            );
        }
        ClientMessage::SubscribeAlerts => {
            state.room_manager.subscribe_alerts(client_id);
            send_message(state, client_id, &ServerMessage::AlertsSubscribed);
        }
        ClientMessage::UnsubscribeAlerts => {
            state.room_manager.unsubscribe_alerts(client_id);
            send_message(state, client_id, &ServerMessage::AlertsUnsubscribed);
        }
    }
}

fn send_message(state: &AppState, client_id: Uuid, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        if let Some(client) = state.room_manager.clients.get(&client_id) {
            let _ = client.tx.send(json);
        }
    }
}

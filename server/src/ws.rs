//! WebSocket transport.
//!
//! Each connection gets an outbox task forwarding frames from its
//! registry channel, and a demux loop handling SUBSCRIBE / UNSUBSCRIBE /
//! MUTATE / PING frames. Subscriptions are dropped with the connection.

use crate::context::RawRequest;
use crate::error::AppError;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tether_engine::{ClientFrame, ErrorCode, ServerFrame};
use tokio::sync::mpsc;

/// GET /ws - upgrade to the sync protocol.
pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let raw = RawRequest::from_headers(&headers);
    tracing::debug!("websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state, raw))
}

async fn handle_socket(socket: WebSocket, state: AppState, raw: RawRequest) {
    let (mut sink, mut stream) = socket.split();
    let (sender, mut outbox) = mpsc::unbounded_channel::<ServerFrame>();
    let conn_id = state.registry.register(sender);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(error) => tracing::error!(%error, "failed to serialize frame"),
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if process_frame(&text, &state, &conn_id, &raw).await {
                    // auth failure limit tripped
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(conn_id = %conn_id, %error, "websocket error");
                break;
            }
        }
    }

    state.registry.unregister(&conn_id);
    send_task.abort();
    tracing::info!(
        conn_id = %conn_id,
        active_connections = state.registry.connection_count(),
        "websocket client disconnected"
    );
}

/// Handle one inbound frame. Returns true when the connection should be
/// dropped.
async fn process_frame(text: &str, state: &AppState, conn_id: &str, raw: &RawRequest) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            // protocol error: report to the originator, keep the session
            state.registry.send_to(
                conn_id,
                ServerFrame::error(
                    ErrorCode::InvalidRequest,
                    format!("invalid frame: {error}"),
                    None,
                ),
            );
            return false;
        }
    };

    match frame {
        ClientFrame::Subscribe { id, query } => {
            match state.server.handle_query(query.clone(), raw.clone()).await {
                Ok(data) => {
                    state.registry.subscribe(conn_id, id, query);
                    state
                        .registry
                        .send_to(conn_id, ServerFrame::QueryResult { id, data });
                    false
                }
                Err(error) => {
                    let unauthorized = matches!(error, AppError::Unauthorized);
                    state.registry.send_to(conn_id, error.frame(Some(id)));
                    unauthorized && state.registry.record_auth_failure(conn_id)
                }
            }
        }
        ClientFrame::Unsubscribe { id } => {
            state.registry.unsubscribe(conn_id, id);
            false
        }
        ClientFrame::Mutate { id, mutation } => {
            match state
                .execute_mutation(mutation, raw.clone(), Some(conn_id))
                .await
            {
                Ok(response) => {
                    let accepted = match &response.data {
                        crate::route::ResponseData::Value(_) => true,
                        _ => response.accepted_values.is_some(),
                    };
                    state.registry.send_to(
                        conn_id,
                        ServerFrame::MutateAck {
                            id,
                            accepted,
                            data: Some(response.data.to_value()),
                            accepted_values: response.accepted_values,
                        },
                    );
                    false
                }
                Err(error) => {
                    let unauthorized = matches!(error, AppError::Unauthorized);
                    state.registry.send_to(conn_id, error.frame(Some(id)));
                    unauthorized && state.registry.record_auth_failure(conn_id)
                }
            }
        }
        ClientFrame::Ping => {
            state.registry.send_to(conn_id, ServerFrame::Pong);
            false
        }
    }
}

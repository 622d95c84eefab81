use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State as AxumState,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use uuid::Uuid;
use wagerboard_types::{LiveMessage, Topic};

use crate::broadcaster::{Connection, Outbound};
use crate::metrics::WsMetrics;
use crate::{Wagerboard, WsConnectionGuard, WsConnectionRejection};

enum OutboundSendError {
    Closed,
    Full,
}

pub(super) async fn leaderboard_ws(
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    topic_ws(wagerboard, Topic::Leaderboard, addr, ws)
}

pub(super) async fn wager_races_ws(
    AxumState(wagerboard): AxumState<Arc<Wagerboard>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    topic_ws(wagerboard, Topic::WagerRaces, addr, ws)
}

fn topic_ws(
    wagerboard: Arc<Wagerboard>,
    topic: Topic,
    addr: SocketAddr,
    ws: WebSocketUpgrade,
) -> Response {
    let guard = match wagerboard.try_acquire_ws_connection(addr.ip()) {
        Ok(guard) => guard,
        Err(reason) => {
            let message = match reason {
                WsConnectionRejection::GlobalLimit => "WebSocket connection limit reached",
                WsConnectionRejection::PerIpLimit => "WebSocket per-IP limit reached",
            };
            tracing::warn!(ip = %addr.ip(), topic = %topic, "{message}");
            return (StatusCode::TOO_MANY_REQUESTS, message).into_response();
        }
    };

    let max_message_bytes = wagerboard.config.ws_max_message_bytes();
    ws.max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_upgrade(move |socket| handle_topic_ws(socket, wagerboard, topic, guard))
        .into_response()
}

async fn handle_topic_ws(
    socket: WebSocket,
    wagerboard: Arc<Wagerboard>,
    topic: Topic,
    _guard: WsConnectionGuard,
) {
    let client_id = Uuid::new_v4().to_string();
    tracing::info!(client_id = %client_id, topic = %topic, "WebSocket connected");
    let (mut sender, mut receiver) = socket.split();
    let (mut connection, mut out_rx) = wagerboard.broadcaster().connect(topic);

    let send_timeout = wagerboard.config.ws_send_timeout();
    let writer_wagerboard = Arc::clone(&wagerboard);
    let mut writer_handle = tokio::spawn(async move {
        let metrics = writer_wagerboard.ws_metrics();
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                Outbound::Payload(text) => Message::Text(text.to_string()),
                Outbound::Ping(data) => Message::Ping(data),
                Outbound::Pong(data) => Message::Pong(data),
            };
            match timeout(send_timeout, sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    metrics.inc_send_error();
                    tracing::warn!("Failed to send live update, client disconnected");
                    break;
                }
                Err(_) => {
                    metrics.inc_send_timeout();
                    tracing::warn!("WebSocket send timed out, closing connection");
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    // Status goes out before the connection joins the topic so it is always
    // the first frame the client sees.
    let status = LiveMessage::ConnectionStatus {
        connected: true,
        client_id: client_id.clone(),
    };
    let queued = match serde_json::to_string(&status) {
        Ok(text) => enqueue(&connection, Outbound::Payload(text.into()), wagerboard.ws_metrics()),
        Err(err) => {
            tracing::warn!("Failed to encode connection status: {err}");
            Err(OutboundSendError::Closed)
        }
    };
    let mut writer_done = false;
    if queued.is_ok() && connection.open() {
        run_connection(
            &wagerboard,
            &connection,
            &mut receiver,
            &mut writer_handle,
            &mut writer_done,
        )
        .await;
    }

    connection.close();
    drop(connection);
    if !writer_done {
        let _ = writer_handle.await;
    }
    tracing::info!(client_id = %client_id, topic = %topic, "WebSocket handler exiting");
}

async fn run_connection(
    wagerboard: &Wagerboard,
    connection: &Connection,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    writer_handle: &mut tokio::task::JoinHandle<()>,
    writer_done: &mut bool,
) {
    let interval = wagerboard.config.ws_heartbeat_interval();
    let grace = wagerboard.config.ws_heartbeat_grace();
    let metrics = wagerboard.ws_metrics();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Client closed WebSocket connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if enqueue(connection, Outbound::Pong(data), metrics).is_err() {
                            tracing::warn!("Failed to enqueue pong, closing connection");
                            break;
                        }
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {:?}", e);
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > grace {
                    metrics.inc_heartbeat_timeout();
                    tracing::warn!("WebSocket heartbeat timed out, closing connection");
                    break;
                }
                if enqueue(connection, Outbound::Ping(Vec::new()), metrics).is_err() {
                    tracing::warn!("Failed to enqueue ping, closing connection");
                    break;
                }
            }
            _ = connection.evicted() => {
                tracing::warn!("WebSocket dropped by fan-out");
                break;
            }
            _ = &mut *writer_handle => {
                *writer_done = true;
                break;
            }
        }
    }
}

fn enqueue(
    connection: &Connection,
    frame: Outbound,
    metrics: &WsMetrics,
) -> Result<(), OutboundSendError> {
    match connection.sender().try_send(frame) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics.inc_queue_full();
            Err(OutboundSendError::Full)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(OutboundSendError::Closed),
    }
}

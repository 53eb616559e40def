//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::world::{WorldError, WorldHandle};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Work for the writer task
enum Outbound {
    /// Reply to this connection only
    Message(ServerMsg),
    /// Start forwarding a world's broadcast
    Subscribe(broadcast::Receiver<ServerMsg>),
    /// Stop forwarding broadcasts
    Unsubscribe,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let connection_id = Uuid::new_v4();
    info!(connection_id = %connection_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, connection_id, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, connection_id: Uuid, state: AppState) {
    info!(connection_id = %connection_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    // Send welcome message
    let welcome = ServerMsg::Welcome {
        connection_id,
        server_time: unix_millis(),
        tick_rate: state.config.sim.tick_rate,
        snapshot_interval: state.config.sim.snapshot_interval,
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(connection_id = %connection_id, error = %e, "Failed to send welcome");
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let writer_handle = tokio::spawn(run_writer(connection_id, ws_sink, outbound_rx));

    let joined = run_reader(connection_id, &state, ws_stream, outbound_tx).await;

    // Cleanup on disconnect
    if let Some(world) = joined {
        if world.disconnect(connection_id).await.is_err() {
            debug!(connection_id = %connection_id, "World already stopped");
        }
    }
    writer_handle.abort();

    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Reader loop: WebSocket -> world. Returns the world joined, if any.
async fn run_reader(
    connection_id: Uuid,
    state: &AppState,
    mut ws_stream: SplitStream<WebSocket>,
    outbound_tx: mpsc::Sender<Outbound>,
) -> Option<WorldHandle> {
    let rate_limiter = ConnectionRateLimiter::new(state.config.sim.input_rate_limit);
    let mut joined: Option<WorldHandle> = None;

    while let Some(result) = ws_stream.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                warn!(connection_id = %connection_id, "Received binary message, ignoring");
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                info!(connection_id = %connection_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        };

        let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Failed to parse client message");
                continue;
            }
        };

        if !admit(&client_msg, &rate_limiter) {
            warn!(connection_id = %connection_id, "Rate limited input");
            continue;
        }

        let reply = match client_msg {
            ClientMsg::Join { world_id } => {
                handle_join(connection_id, state, world_id, &mut joined, &outbound_tx).await
            }
            ClientMsg::Input(message) => {
                let Some(world) = &joined else {
                    debug!(connection_id = %connection_id, "Input before join, ignoring");
                    continue;
                };
                match world.send_input(connection_id, message) {
                    Ok(()) => None,
                    Err(WorldError::Closed) => {
                        Some(ServerMsg::error("world_closed", "World is no longer running"))
                    }
                    Err(e) => {
                        debug!(connection_id = %connection_id, error = %e, "Input dropped");
                        None
                    }
                }
            }
            ClientMsg::Ping { t } => Some(ServerMsg::Pong { t }),
            ClientMsg::Leave => {
                handle_leave(connection_id, &mut joined, &outbound_tx).await;
                None
            }
        };

        if let Some(msg) = reply {
            if outbound_tx.send(Outbound::Message(msg)).await.is_err() {
                debug!(connection_id = %connection_id, "Writer gone");
                break;
            }
        }
    }

    joined
}

/// Resolve the requested world, subscribe to it and spawn an actor
async fn handle_join(
    connection_id: Uuid,
    state: &AppState,
    world_id: Option<Uuid>,
    joined: &mut Option<WorldHandle>,
    outbound_tx: &mpsc::Sender<Outbound>,
) -> Option<ServerMsg> {
    if joined.is_some() {
        return Some(ServerMsg::error("already_joined", "Leave the current world first"));
    }

    let world = match world_id {
        Some(id) => match state.registry.get(&id) {
            Some(world) => world,
            None => return Some(ServerMsg::error("world_not_found", format!("No world {id}"))),
        },
        None => state.default_world.clone(),
    };

    // Subscribe before spawning so the first snapshot is not missed
    let updates = world.subscribe();
    match world.spawn(connection_id).await {
        Ok(info) => {
            info!(
                connection_id = %connection_id,
                world_id = %info.world_id,
                actor_id = %info.actor_id,
                "Connection joined world"
            );
            *joined = Some(world);

            // The client must learn its actor id before any broadcast names it
            let spawned = ServerMsg::Spawned {
                world_id: info.world_id,
                actor_id: info.actor_id,
                snapshot: info.snapshot,
            };
            if outbound_tx.send(Outbound::Message(spawned)).await.is_err()
                || outbound_tx.send(Outbound::Subscribe(updates)).await.is_err()
            {
                debug!(connection_id = %connection_id, "Writer gone during join");
            }
            None
        }
        Err(WorldError::Full(limit)) => Some(ServerMsg::error(
            "world_full",
            format!("World is full ({limit} actors)"),
        )),
        Err(e) => Some(ServerMsg::error("spawn_failed", e.to_string())),
    }
}

/// Only inputs draw from the per-connection quota
fn admit(msg: &ClientMsg, limiter: &ConnectionRateLimiter) -> bool {
    !matches!(msg, ClientMsg::Input(_)) || limiter.check_input()
}

async fn handle_leave(
    connection_id: Uuid,
    joined: &mut Option<WorldHandle>,
    outbound_tx: &mpsc::Sender<Outbound>,
) {
    let Some(world) = joined.take() else {
        debug!(connection_id = %connection_id, "Leave without a world");
        return;
    };

    if let Err(e) = world.disconnect(connection_id).await {
        debug!(connection_id = %connection_id, error = %e, "Disconnect on leave failed");
    }
    if outbound_tx.send(Outbound::Unsubscribe).await.is_err() {
        debug!(connection_id = %connection_id, "Writer gone before unsubscribe");
    }
}

/// Writer loop: direct replies and world broadcasts -> WebSocket
async fn run_writer(
    connection_id: Uuid,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    let mut updates: Option<broadcast::Receiver<ServerMsg>> = None;

    loop {
        let msg = tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Message(msg)) => msg,
                Some(Outbound::Subscribe(rx)) => {
                    updates = Some(rx);
                    continue;
                }
                Some(Outbound::Unsubscribe) => {
                    updates = None;
                    continue;
                }
                None => break,
            },
            update = next_update(&mut updates) => match update {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        connection_id = %connection_id,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                    // Continue - don't disconnect for lag
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(connection_id = %connection_id, "World broadcast closed");
                    updates = None;
                    continue;
                }
            },
        };

        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
            debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
            break;
        }
    }
}

/// Next broadcast message, or never when not subscribed
async fn next_update(
    updates: &mut Option<broadcast::Receiver<ServerMsg>>,
) -> Result<ServerMsg, broadcast::error::RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SimConfig};
    use crate::ws::protocol::InputMessage;

    fn test_state() -> AppState {
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "debug".to_string(),
            client_origin: String::new(),
            sim: SimConfig::default(),
        };
        let (state, world) = AppState::new(config);
        tokio::spawn(world.run());
        state
    }

    #[test]
    fn only_inputs_use_the_quota() {
        let limiter = ConnectionRateLimiter::new(1);
        let input = ClientMsg::Input(InputMessage {
            actor_id: Uuid::nil(),
            tick: 1,
            throttle: 1.0,
            turn: 0.0,
            action_flags: 0,
        });

        assert!(admit(&input, &limiter));
        assert!(!admit(&input, &limiter));
        assert!(admit(&ClientMsg::Ping { t: 1 }, &limiter));
        assert!(admit(&ClientMsg::Leave, &limiter));
        assert!(admit(&ClientMsg::Join { world_id: None }, &limiter));
    }

    #[tokio::test]
    async fn join_queues_spawned_before_subscribing() {
        let state = test_state();
        let connection_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        let mut joined = None;

        let reply = handle_join(connection_id, &state, None, &mut joined, &tx).await;
        assert!(reply.is_none());
        assert!(joined.is_some());

        let Some(Outbound::Message(ServerMsg::Spawned { world_id, .. })) = rx.recv().await else {
            panic!("expected the spawned reply first");
        };
        assert_eq!(world_id, state.default_world.id);
        assert!(matches!(rx.recv().await, Some(Outbound::Subscribe(_))));
    }

    #[tokio::test]
    async fn leave_despawns_and_unsubscribes() {
        let state = test_state();
        let connection_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        let mut joined = None;

        handle_join(connection_id, &state, None, &mut joined, &tx).await;
        assert_eq!(state.default_world.actor_count(), 1);
        while let Ok(outbound) = rx.try_recv() {
            assert!(!matches!(outbound, Outbound::Unsubscribe));
        }

        handle_leave(connection_id, &mut joined, &tx).await;
        assert!(joined.is_none());
        assert!(matches!(rx.recv().await, Some(Outbound::Unsubscribe)));

        // Disconnect is applied at the next tick boundary
        for _ in 0..50 {
            if state.default_world.actor_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(state.default_world.actor_count(), 0);

        // A second leave is a no-op
        handle_leave(connection_id, &mut joined, &tx).await;
        assert!(rx.try_recv().is_err());
    }
}

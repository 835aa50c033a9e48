use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use banter_types::api::AuthenticatedSession;
use banter_types::events::HubCommand;

use crate::hub::Hub;

/// Serve one authenticated hub socket until either side goes away.
///
/// The token was validated at the HTTP upgrade, so the session is final.
/// A send task forwards hub events and pings; a receive task feeds client
/// commands to the hub. When one ends the other is aborted.
pub async fn handle_connection(socket: WebSocket, hub: Hub, session: AuthenticatedSession) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut events) = mpsc::unbounded_channel();

    let connection_id = match hub.connect(&session, tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!("{} ({}) could not connect: {}", session.display_name, session.user_id, e);
            if let Ok(json) = serde_json::to_string(&e.to_event()) {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;
    let heartbeat_every = hub.config().heartbeat_interval;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return "hub dropped the connection";
                    };

                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode hub event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        return "send failed";
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            return "heartbeat timeout";
                        }
                    }
                    if sender.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        return "ping failed";
                    }
                }
            }
        }
    });

    let recv_hub = hub.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<HubCommand>(&text) {
                    Ok(cmd) => {
                        trace!("{} command: {:?}", recv_session.user_id, cmd);
                        recv_hub.handle_command(&recv_session, connection_id, cmd).await;
                    }
                    Err(e) => {
                        let raw: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_session.display_name, recv_session.user_id, e, raw
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => return "client closed",
                _ => {}
            }
        }
        "stream ended"
    });

    let reason = tokio::select! {
        res = &mut send_task => {
            recv_task.abort();
            res.unwrap_or("send task failed")
        }
        res = &mut recv_task => {
            send_task.abort();
            res.unwrap_or("receive task failed")
        }
    };

    hub.disconnect(connection_id, reason).await;
}

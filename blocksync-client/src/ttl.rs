//! Client heartbeat worker.
//!
//! Announces itself on the heartbeat channel, echoes every ping from the
//! server, and declares the server lost when nothing has been heard for
//! the configured timeout. Loss detection is local: this side decides on
//! its own that the peer is gone.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use blocksync_core::config::SessionConfig;
use blocksync_core::error::Result;
use blocksync_core::protocol::{TTL_INIT, TTL_PING, read_parts, write_identity, write_parts};

use crate::session::ClientEvent;

/// Run the client heartbeat worker until it stops or the server is lost.
pub(crate) async fn run_client_ttl(
    config: SessionConfig,
    identity: Uuid,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    stop_rx: watch::Receiver<bool>,
) {
    let events = events_tx.clone();
    if let Err(err) = ttl_inner(config, identity, events_tx, stop_rx).await {
        let _ = events.send(ClientEvent::ConnectionFailed {
            reason: format!("heartbeat channel failed: {err}"),
        });
    }
}

async fn ttl_inner(
    config: SessionConfig,
    identity: Uuid,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let stream = TcpStream::connect(config.ttl_addr()).await?;
    stream.set_nodelay(true).ok();
    let (read, mut writer) = stream.into_split();
    write_identity(&mut writer, identity).await?;
    write_parts(&mut writer, &[Bytes::from_static(TTL_INIT)]).await?;

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    tokio::spawn(ttl_reader(read, msg_tx));

    let timeout = Duration::from_millis(config.connection_timeout_ms);
    let mut tick = tokio::time::interval(Duration::from_millis(config.ttl_tick_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return Ok(()),

            maybe = msg_rx.recv() => match maybe {
                Some(data) => {
                    if data.as_ref() == TTL_PING {
                        last_heard = Instant::now();
                        write_parts(&mut writer, &[Bytes::from_static(TTL_PING)]).await?;
                    } else {
                        debug!("unexpected heartbeat message, skipping it");
                    }
                }
                None => {
                    let _ = events_tx.send(ClientEvent::Disconnected {
                        reason: "connection closed".to_string(),
                    });
                    return Ok(());
                }
            },

            _ = tick.tick() => {
                if last_heard.elapsed() > timeout {
                    let _ = events_tx.send(ClientEvent::Disconnected {
                        reason: "server unresponsive".to_string(),
                    });
                    return Ok(());
                }
            }
        }
    }
}

async fn ttl_reader(mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<Bytes>) {
    loop {
        match read_parts(&mut read).await {
            Ok(parts) => {
                let [data] = parts.as_slice() else {
                    warn!("corrupted heartbeat frame received, skipping it");
                    continue;
                };
                if tx.send(data.clone()).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

//! Heartbeat monitor.
//!
//! Runs on its own channel so a stalled data pipeline cannot mask the
//! health signal. Each tracked peer carries its last-sent and
//! last-received timestamps; latency is the absolute difference between
//! them. A peer whose latency exceeds the timeout is reported lost to the
//! session over the control pipe and dropped from the watchlist. Loss
//! detection is local: only the side that stops hearing from a peer
//! declares it lost.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use blocksync_core::protocol::{TTL_INIT, TTL_PING, read_identity, read_parts, write_parts};

/// Notifications from the monitor to the server session.
#[derive(Debug)]
pub enum TtlEvent {
    /// A peer exceeded the timeout and was dropped from the watchlist.
    Lost(Uuid),
    /// Fresh latency figures for every tracked peer, sent each tick.
    Latency(HashMap<Uuid, u64>),
}

/// Requests from the server session to the monitor.
#[derive(Debug)]
pub enum TtlControl {
    /// Stop tracking a peer (kicked or already disconnected).
    StopWatching(Uuid),
}

struct PeerState {
    last_received: Instant,
    last_sent: Instant,
    latency_ms: u64,
}

enum TtlInbound {
    Conn { identity: Uuid, writer: OwnedWriteHalf },
    Msg { identity: Uuid, data: Bytes },
    Closed { identity: Uuid },
}

fn abs_delta_ms(a: Instant, b: Instant) -> u64 {
    a.saturating_duration_since(b)
        .max(b.saturating_duration_since(a))
        .as_millis() as u64
}

/// Run the heartbeat monitor until stopped.
pub async fn run_ttl_monitor(
    listener: TcpListener,
    timeout_ms: u64,
    ping_interval_ms: u64,
    tick_ms: u64,
    events_tx: mpsc::UnboundedSender<TtlEvent>,
    mut ctrl_rx: mpsc::UnboundedReceiver<TtlControl>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let ping_interval = Duration::from_millis(ping_interval_ms);
    let mut tick = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<TtlInbound>();
    let mut peers: HashMap<Uuid, PeerState> = HashMap::new();
    let mut writers: HashMap<Uuid, OwnedWriteHalf> = HashMap::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let (read, writer) = stream.into_split();
                    tokio::spawn(ttl_conn_reader(read, writer, inbound_tx.clone()));
                }
                Err(err) => warn!("heartbeat accept failed: {err}"),
            },

            maybe = inbound_rx.recv() => match maybe {
                Some(TtlInbound::Conn { identity, writer }) => {
                    writers.insert(identity, writer);
                }
                Some(TtlInbound::Msg { identity, data }) => {
                    let now = Instant::now();
                    if data.as_ref() == TTL_INIT {
                        peers.insert(identity, PeerState {
                            last_received: now,
                            last_sent: now,
                            latency_ms: 999,
                        });
                        send_ping(&mut writers, identity).await;
                    }
                    if let Some(peer) = peers.get_mut(&identity) {
                        peer.last_received = now;
                    }
                }
                Some(TtlInbound::Closed { identity }) => {
                    writers.remove(&identity);
                }
                None => break,
            },

            maybe = ctrl_rx.recv() => match maybe {
                Some(TtlControl::StopWatching(identity)) => {
                    debug!(%identity, "removing client from watchlist");
                    peers.remove(&identity);
                    writers.remove(&identity);
                }
                None => break,
            },

            _ = tick.tick() => {
                let now = Instant::now();

                // Latency sweep and loss detection.
                let mut lost = Vec::new();
                for (identity, peer) in peers.iter_mut() {
                    peer.latency_ms = abs_delta_ms(peer.last_received, peer.last_sent);
                    if peer.latency_ms > timeout_ms {
                        lost.push(*identity);
                    }
                }
                for identity in lost {
                    peers.remove(&identity);
                    writers.remove(&identity);
                    let _ = events_tx.send(TtlEvent::Lost(identity));
                }

                let table: HashMap<Uuid, u64> =
                    peers.iter().map(|(id, p)| (*id, p.latency_ms)).collect();
                let _ = events_tx.send(TtlEvent::Latency(table));

                // Ping anyone who has been silent past the ping interval.
                let stale: Vec<Uuid> = peers
                    .iter()
                    .filter(|(_, p)| {
                        now.duration_since(p.last_received) > ping_interval
                            && now.duration_since(p.last_sent) > ping_interval
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for identity in stale {
                    if send_ping(&mut writers, identity).await {
                        if let Some(peer) = peers.get_mut(&identity) {
                            peer.last_sent = now;
                        }
                    }
                }
            }
        }
    }
}

async fn send_ping(writers: &mut HashMap<Uuid, OwnedWriteHalf>, identity: Uuid) -> bool {
    let Some(writer) = writers.get_mut(&identity) else {
        return false;
    };
    match write_parts(writer, &[Bytes::from_static(TTL_PING)]).await {
        Ok(()) => true,
        Err(err) => {
            debug!(%identity, "heartbeat ping failed: {err}");
            writers.remove(&identity);
            false
        }
    }
}

async fn ttl_conn_reader(
    mut read: OwnedReadHalf,
    writer: OwnedWriteHalf,
    inbound_tx: mpsc::UnboundedSender<TtlInbound>,
) {
    let identity = match read_identity(&mut read).await {
        Ok(identity) => identity,
        Err(err) => {
            debug!("heartbeat connection without identity hello: {err}");
            return;
        }
    };
    if inbound_tx
        .send(TtlInbound::Conn { identity, writer })
        .is_err()
    {
        return;
    }
    loop {
        match read_parts(&mut read).await {
            Ok(parts) => {
                let [data] = parts.as_slice() else {
                    warn!(%identity, "corrupted heartbeat frame received, skipping it");
                    continue;
                };
                if inbound_tx
                    .send(TtlInbound::Msg {
                        identity,
                        data: data.clone(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(_) => {
                let _ = inbound_tx.send(TtlInbound::Closed { identity });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_core::protocol::write_identity;
    use tokio::net::TcpStream;

    async fn monitor_fixture(
        timeout_ms: u64,
        ping_ms: u64,
        tick_ms: u64,
    ) -> (
        std::net::SocketAddr,
        mpsc::UnboundedReceiver<TtlEvent>,
        mpsc::UnboundedSender<TtlControl>,
        watch::Sender<bool>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_ttl_monitor(
            listener, timeout_ms, ping_ms, tick_ms, events_tx, ctrl_rx, stop_rx,
        ));
        (addr, events_rx, ctrl_tx, stop_tx)
    }

    #[tokio::test]
    async fn test_silent_peer_reported_lost_within_timeout_plus_tick() {
        let (addr, mut events_rx, _ctrl_tx, stop_tx) = monitor_fixture(200, 50, 20).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let identity = Uuid::new_v4();
        write_identity(&mut stream, identity).await.unwrap();
        write_parts(&mut stream, &[Bytes::from_static(TTL_INIT)])
            .await
            .unwrap();
        // Never answer any ping.

        let deadline = Instant::now() + Duration::from_millis(2000);
        let mut lost = None;
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await {
                Ok(Some(TtlEvent::Lost(id))) => {
                    lost = Some(id);
                    break;
                }
                Ok(Some(TtlEvent::Latency(_))) => continue,
                _ => break,
            }
        }
        assert_eq!(lost, Some(identity));
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_responsive_peer_never_reported_lost() {
        let (addr, mut events_rx, _ctrl_tx, stop_tx) = monitor_fixture(300, 50, 20).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let identity = Uuid::new_v4();
        write_identity(&mut stream, identity).await.unwrap();
        write_parts(&mut stream, &[Bytes::from_static(TTL_INIT)])
            .await
            .unwrap();

        // Echo every ping, as the client heartbeat worker does.
        let echo = tokio::spawn(async move {
            loop {
                match read_parts(&mut stream).await {
                    Ok(parts) if parts.first().map(|p| p.as_ref()) == Some(TTL_PING) => {
                        if write_parts(&mut stream, &[Bytes::from_static(TTL_PING)])
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });

        let deadline = Instant::now() + Duration::from_millis(1200);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await {
                Ok(Some(TtlEvent::Lost(id))) => panic!("responsive peer {id} reported lost"),
                Ok(Some(TtlEvent::Latency(table))) => {
                    if let Some(latency) = table.get(&identity) {
                        assert!(*latency <= 300, "latency {latency} past timeout");
                    }
                }
                _ => break,
            }
        }
        let _ = stop_tx.send(true);
        echo.abort();
    }

    #[tokio::test]
    async fn test_stop_watching_removes_peer() {
        let (addr, mut events_rx, ctrl_tx, stop_tx) = monitor_fixture(5000, 1000, 20).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let identity = Uuid::new_v4();
        write_identity(&mut stream, identity).await.unwrap();
        write_parts(&mut stream, &[Bytes::from_static(TTL_INIT)])
            .await
            .unwrap();

        // Wait until the peer shows up in a latency table.
        let deadline = Instant::now() + Duration::from_millis(1000);
        loop {
            assert!(Instant::now() < deadline, "peer never tracked");
            if let Ok(Some(TtlEvent::Latency(table))) =
                tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await
            {
                if table.contains_key(&identity) {
                    break;
                }
            }
        }

        ctrl_tx.send(TtlControl::StopWatching(identity)).unwrap();

        // After removal the peer must neither reappear nor be reported lost.
        let deadline = Instant::now() + Duration::from_millis(600);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await {
                Ok(Some(TtlEvent::Latency(table))) => assert!(!table.contains_key(&identity)),
                Ok(Some(TtlEvent::Lost(id))) => assert_ne!(id, identity),
                _ => break,
            }
        }
        let _ = stop_tx.send(true);
    }
}

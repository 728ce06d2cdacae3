//! Real-time metrics fan-out over WebSocket.
//!
//! The hub tracks subscribers; each connection gets the latest snapshot on
//! connect, then every new one in producer order. A subscriber that lags
//! loses the oldest queued frames (counted per subscriber). Heartbeat
//! pings every 15 s; a peer idle past 30 s is closed. Resources release
//! unconditionally on disconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::metrics::{Collector, MetricsSnapshot};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct SubscriberStats {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

struct Subscriber {
    connected_at: DateTime<Utc>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

pub struct Hub {
    collector: Arc<Collector>,
    subscribers: DashMap<Uuid, Subscriber>,
}

impl Hub {
    pub fn new(collector: Arc<Collector>) -> Arc<Self> {
        Arc::new(Self { collector, subscribers: DashMap::new() })
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        self.subscribers
            .iter()
            .map(|entry| SubscriberStats {
                id: *entry.key(),
                connected_at: entry.value().connected_at,
                frames_sent: entry.value().sent.load(Ordering::Relaxed),
                frames_dropped: entry.value().dropped.load(Ordering::Relaxed),
            })
            .collect()
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws/metrics", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber(socket, hub))
}

/// Removes the subscriber and logs, whatever path the connection dies on.
struct SubscriberGuard {
    hub: Arc<Hub>,
    id: Uuid,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if let Some((_, sub)) = self.hub.subscribers.remove(&self.id) {
            tracing::info!(
                subscriber = %self.id,
                sent = sub.sent.load(Ordering::Relaxed),
                dropped = sub.dropped.load(Ordering::Relaxed),
                "metrics subscriber disconnected"
            );
        }
    }
}

async fn handle_subscriber(mut socket: WebSocket, hub: Arc<Hub>) {
    let id = Uuid::new_v4();
    let sent = Arc::new(AtomicU64::new(0));
    let dropped = Arc::new(AtomicU64::new(0));
    hub.subscribers.insert(
        id,
        Subscriber { connected_at: Utc::now(), sent: sent.clone(), dropped: dropped.clone() },
    );
    let _guard = SubscriberGuard { hub: hub.clone(), id };
    tracing::info!(subscriber = %id, "metrics subscriber connected");

    // Latest snapshot immediately, so a fresh client renders at once.
    if let Some(snapshot) = hub.collector.latest() {
        if send_snapshot(&mut socket, &snapshot, &sent).await.is_err() {
            return;
        }
    }

    let mut frames = hub.collector.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Ok(snapshot) => {
                        if send_snapshot(&mut socket, &snapshot, &sent).await.is_err() {
                            break;
                        }
                    }
                    // The broadcast queue evicts oldest-first; count what
                    // this subscriber missed.
                    Err(RecvError::Lagged(n)) => {
                        dropped.fetch_add(n, Ordering::Relaxed);
                        tracing::debug!(subscriber = %id, lagged = n, "subscriber dropped frames");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    tracing::info!(subscriber = %id, "closing idle metrics subscriber");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_activity = Instant::now(),
                    Some(Err(e)) => {
                        tracing::debug!(subscriber = %id, error = %e, "websocket error");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_snapshot(
    socket: &mut WebSocket,
    snapshot: &MetricsSnapshot,
    sent: &AtomicU64,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await?;
    sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::store::{SharedStore, SqliteProvider};

    fn hub() -> Arc<Hub> {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        let store: SharedStore = Arc::new(provider);
        Hub::new(Collector::new(store, Duration::from_secs(1)))
    }

    #[test]
    fn test_empty_hub_stats() {
        let hub = hub();
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.subscriber_stats().is_empty());
    }

    #[test]
    fn test_guard_releases_subscriber() {
        let hub = hub();
        let id = Uuid::new_v4();
        hub.subscribers.insert(
            id,
            Subscriber {
                connected_at: Utc::now(),
                sent: Arc::new(AtomicU64::new(3)),
                dropped: Arc::new(AtomicU64::new(1)),
            },
        );
        assert_eq!(hub.connection_count(), 1);
        drop(SubscriberGuard { hub: hub.clone(), id });
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn test_subscriber_stats_expose_counters() {
        let hub = hub();
        let id = Uuid::new_v4();
        hub.subscribers.insert(
            id,
            Subscriber {
                connected_at: Utc::now(),
                sent: Arc::new(AtomicU64::new(30)),
                dropped: Arc::new(AtomicU64::new(2)),
            },
        );
        let stats = hub.subscriber_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].frames_sent, 30);
        assert_eq!(stats[0].frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_producer_order_with_drop_accounting() {
        // Model the per-subscriber queue: a lagging receiver loses the
        // oldest frames and the Lagged count records exactly how many.
        let (tx, mut rx) = tokio::sync::broadcast::channel::<u64>(4);
        for frame in 0..10u64 {
            tx.send(frame).unwrap();
        }

        let mut received = Vec::new();
        let mut dropped = 0u64;
        loop {
            match rx.try_recv() {
                Ok(frame) => received.push(frame),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(n)) => dropped += n,
                Err(_) => break,
            }
        }
        assert_eq!(received.len() as u64 + dropped, 10);
        // Survivors are the newest frames, still in producer order.
        let mut sorted = received.clone();
        sorted.sort_unstable();
        assert_eq!(received, sorted);
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use wagerboard_types::{LiveMessage, Topic};

use crate::metrics::WsMetrics;

pub type ConnectionId = u64;

/// Frames queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Payload(Arc<str>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct Shared {
    state: AtomicU8,
    evicted: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => ConnectionState::Connecting,
            STATE_OPEN => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

struct Subscriber {
    sender: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
}

/// Topic-keyed registry of open connections.
///
/// Fan-out never waits on a socket: payloads are `try_send`-ed into bounded
/// per-connection queues and a connection whose queue is full or gone is
/// evicted without affecting the others.
pub struct Broadcaster {
    topics: Mutex<HashMap<Topic, HashMap<ConnectionId, Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
    metrics: Arc<WsMetrics>,
}

impl Broadcaster {
    pub fn new(capacity: usize, metrics: Arc<WsMetrics>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Creates a connection in the `Connecting` state along with the receiving
    /// end of its outbound queue. It receives nothing until [Connection::open].
    pub fn connect(self: &Arc<Self>, topic: Topic) -> (Connection, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let connection = Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic,
            sender,
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CONNECTING),
                evicted: Notify::new(),
            }),
            broadcaster: Arc::clone(self),
        };
        (connection, receiver)
    }

    /// Delivers `payload` to every connection open on `topic` right now.
    /// Returns the number of connections it was queued for.
    pub fn notify(&self, topic: Topic, payload: Arc<str>) -> usize {
        let mut topics = self.lock_topics();
        let Some(subscribers) = topics.get_mut(&topic) else {
            return 0;
        };

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            match subscriber.sender.try_send(Outbound::Payload(Arc::clone(&payload))) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.inc_queue_full();
                    tracing::warn!(connection = id, topic = %topic, "outbound queue full, dropping connection");
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(connection = id, topic = %topic, "outbound queue closed");
                    evicted.push(*id);
                }
            }
        }
        for id in evicted {
            if let Some(subscriber) = subscribers.remove(&id) {
                self.mark_closed(&subscriber.shared);
                subscriber.shared.evicted.notify_one();
            }
        }
        if subscribers.is_empty() {
            topics.remove(&topic);
        }
        self.metrics.add_delivered(delivered as u64);
        delivered
    }

    /// Serializes `message` once and notifies its topic.
    pub fn publish(&self, message: &LiveMessage) -> Result<usize, serde_json::Error> {
        let Some(topic) = message.topic() else {
            return Ok(0);
        };
        let payload: Arc<str> = serde_json::to_string(message)?.into();
        Ok(self.notify(topic, payload))
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock_topics().get(&topic).map_or(0, HashMap::len)
    }

    fn register(&self, topic: Topic, id: ConnectionId, subscriber: Subscriber) {
        self.lock_topics()
            .entry(topic)
            .or_default()
            .insert(id, subscriber);
        self.metrics.inc_opened();
    }

    fn unregister(&self, topic: Topic, id: ConnectionId, shared: &Shared) {
        let removed = {
            let mut topics = self.lock_topics();
            let removed = topics
                .get_mut(&topic)
                .and_then(|subscribers| subscribers.remove(&id));
            if topics.get(&topic).is_some_and(HashMap::is_empty) {
                topics.remove(&topic);
            }
            removed
        };
        if removed.is_some() {
            self.mark_closed(shared);
        }
    }

    // Counts the Open -> Closed edge exactly once, whoever gets there first.
    fn mark_closed(&self, shared: &Shared) {
        if shared
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.metrics.inc_closed();
        } else {
            shared.state.store(STATE_CLOSED, Ordering::Release);
        }
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<Topic, HashMap<ConnectionId, Subscriber>>> {
        match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => {
                tracing::warn!("subscriber registry lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// One subscriber's handle on the registry. Dropping it closes the connection.
pub struct Connection {
    id: ConnectionId,
    topic: Topic,
    sender: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    broadcaster: Arc<Broadcaster>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Queue used for frames the connection sends on its own behalf.
    pub fn sender(&self) -> &mpsc::Sender<Outbound> {
        &self.sender
    }

    /// `Connecting -> Open`: joins the topic's subscriber set.
    /// Returns false if the connection was not `Connecting`.
    pub fn open(&mut self) -> bool {
        if self
            .shared
            .state
            .compare_exchange(STATE_CONNECTING, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.broadcaster.register(
            self.topic,
            self.id,
            Subscriber {
                sender: self.sender.clone(),
                shared: Arc::clone(&self.shared),
            },
        );
        true
    }

    /// Moves to `Closed` and leaves the subscriber set. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.broadcaster.unregister(self.topic, self.id, &self.shared);
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Resolves once fan-out has dropped this connection.
    pub async fn evicted(&self) {
        self.shared.evicted.notified().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wagerboard_types::LeaderboardResponse;

    fn broadcaster(capacity: usize) -> Arc<Broadcaster> {
        Arc::new(Broadcaster::new(capacity, Arc::new(WsMetrics::default())))
    }

    fn open(broadcaster: &Arc<Broadcaster>, topic: Topic) -> (Connection, mpsc::Receiver<Outbound>) {
        let (mut connection, receiver) = broadcaster.connect(topic);
        assert!(connection.open());
        (connection, receiver)
    }

    fn payload(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn test_state_machine() {
        let broadcaster = broadcaster(4);
        let (mut connection, _rx) = broadcaster.connect(Topic::Leaderboard);
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(broadcaster.subscriber_count(Topic::Leaderboard), 0);

        assert!(connection.open());
        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(!connection.open());
        assert_eq!(broadcaster.subscriber_count(Topic::Leaderboard), 1);

        connection.close();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.open());
        assert_eq!(broadcaster.subscriber_count(Topic::Leaderboard), 0);

        let metrics = broadcaster.metrics.snapshot();
        assert_eq!(metrics.connections_opened, 1);
        assert_eq!(metrics.connections_closed, 1);
        assert_eq!(metrics.active_connections, 0);
    }

    #[test]
    fn test_notify_reaches_every_open_connection_on_topic() {
        let broadcaster = broadcaster(4);
        let (_a, mut rx_a) = open(&broadcaster, Topic::Leaderboard);
        let (_b, mut rx_b) = open(&broadcaster, Topic::Leaderboard);
        let (_other, mut rx_other) = open(&broadcaster, Topic::WagerRaces);
        let (_pending, mut rx_pending) = broadcaster.connect(Topic::Leaderboard);

        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("x")), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Payload(payload("x")));
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Payload(payload("x")));
        assert!(rx_other.try_recv().is_err());
        assert!(rx_pending.try_recv().is_err());
    }

    #[test]
    fn test_closed_and_late_connections_are_not_reached() {
        let broadcaster = broadcaster(4);
        let (closed, mut rx_closed) = open(&broadcaster, Topic::Leaderboard);
        drop(closed);

        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("first")), 0);
        assert!(rx_closed.try_recv().is_err());

        let (_late, mut rx_late) = open(&broadcaster, Topic::Leaderboard);
        assert!(rx_late.try_recv().is_err());
        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("second")), 1);
        assert_eq!(rx_late.try_recv().unwrap(), Outbound::Payload(payload("second")));
        assert!(rx_late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_that_connection() {
        let broadcaster = broadcaster(1);
        let (slow, _rx_slow) = open(&broadcaster, Topic::Leaderboard);
        let (_fast, mut rx_fast) = open(&broadcaster, Topic::Leaderboard);

        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("1")), 2);
        assert_eq!(rx_fast.try_recv().unwrap(), Outbound::Payload(payload("1")));

        // The slow queue still holds "1", so "2" does not fit.
        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("2")), 1);
        assert_eq!(rx_fast.try_recv().unwrap(), Outbound::Payload(payload("2")));
        assert_eq!(slow.state(), ConnectionState::Closed);
        tokio::time::timeout(Duration::from_secs(1), slow.evicted())
            .await
            .expect("eviction should be signalled");
        assert_eq!(broadcaster.subscriber_count(Topic::Leaderboard), 1);

        let metrics = broadcaster.metrics.snapshot();
        assert_eq!(metrics.queue_full, 1);
        assert_eq!(metrics.connections_closed, 1);
        drop(slow);
        assert_eq!(broadcaster.metrics.snapshot().connections_closed, 1);
    }

    #[test]
    fn test_dropped_receiver_is_evicted() {
        let broadcaster = broadcaster(4);
        let (gone, rx_gone) = open(&broadcaster, Topic::WagerRaces);
        let (_alive, mut rx_alive) = open(&broadcaster, Topic::WagerRaces);
        drop(rx_gone);

        assert_eq!(broadcaster.notify(Topic::WagerRaces, payload("r")), 1);
        assert_eq!(gone.state(), ConnectionState::Closed);
        assert!(rx_alive.try_recv().is_ok());
    }

    #[test]
    fn test_evicting_last_subscriber_removes_topic() {
        let broadcaster = broadcaster(4);
        let (gone, rx_gone) = open(&broadcaster, Topic::Leaderboard);
        drop(rx_gone);

        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("l")), 0);
        assert_eq!(gone.state(), ConnectionState::Closed);
        assert!(!broadcaster.lock_topics().contains_key(&Topic::Leaderboard));

        let (_next, mut rx_next) = open(&broadcaster, Topic::Leaderboard);
        assert_eq!(broadcaster.notify(Topic::Leaderboard, payload("l")), 1);
        assert!(rx_next.try_recv().is_ok());
    }

    #[test]
    fn test_publish_routes_by_message_topic() {
        let broadcaster = broadcaster(4);
        let (_board, mut rx_board) = open(&broadcaster, Topic::Leaderboard);
        let (_races, mut rx_races) = open(&broadcaster, Topic::WagerRaces);

        let message = LiveMessage::LeaderboardUpdate {
            data: Box::new(LeaderboardResponse::default()),
        };
        assert_eq!(broadcaster.publish(&message).unwrap(), 1);
        let Outbound::Payload(text) = rx_board.try_recv().unwrap() else {
            panic!("expected payload");
        };
        let decoded: LiveMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, message);
        assert!(rx_races.try_recv().is_err());

        let status = LiveMessage::ConnectionStatus {
            connected: true,
            client_id: "c".to_string(),
        };
        assert_eq!(broadcaster.publish(&status).unwrap(), 0);
    }
}

//! In-process broker with MQTT delivery semantics.
//!
//! Every connected [`MemoryClient`] receives every published message whose
//! topic matches one of its routes, its own publications included.  Retained
//! messages are stored per topic, replayed to each new route that matches,
//! and cleared by publishing an empty retained payload.
//!
//! Each client delivers on its own `memory-io` thread, in publish order.
//! [`MemoryBroker::settle`] waits until every delivery queue has drained,
//! including messages published by handlers while draining.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use sigbridge_types::{BridgeError, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{MessageHandler, RouteId, RouteTable, Transport};
use crate::topic::matches_filter;

enum Delivery {
    Broadcast(Message),
    Only(RouteId, Message),
    Barrier(oneshot::Sender<()>),
}

#[derive(Default)]
struct BrokerInner {
    clients: Mutex<Vec<Weak<ClientShared>>>,
    retained: Mutex<BTreeMap<String, Message>>,
}

/// Shared in-process broker.  Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client called `client_id`.
    pub fn client(&self, client_id: &str) -> Arc<MemoryClient> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let shared = Arc::new(ClientShared {
            client_id: client_id.to_string(),
            routes: RouteTable::new(),
            tx: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
            processed: AtomicU64::new(0),
        });
        self.inner.clients.lock().push(Arc::downgrade(&shared));

        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("memory-io-{client_id}"))
            .spawn(move || {
                while let Some(delivery) = rx.blocking_recv() {
                    worker.deliver(delivery);
                }
                trace!(client = %worker.client_id, "memory delivery thread exiting");
            });
        if let Err(e) = spawned {
            // Without a delivery thread the client can still publish.
            debug!(client = %client_id, error = %e, "failed to spawn memory delivery thread");
            shared.connected.store(false, Ordering::SeqCst);
        }

        Arc::new(MemoryClient {
            broker: self.clone(),
            shared,
            published: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// Publish from outside any client, like a command-line tool would.
    pub fn publish(&self, message: Message) {
        if message.retained {
            let mut retained = self.inner.retained.lock();
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.clone());
            }
        }
        for client in self.live_clients() {
            client.enqueue(Delivery::Broadcast(message.clone()));
        }
    }

    /// The retained message currently stored for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.inner.retained.lock().get(topic).cloned()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.live_clients().len()
    }

    /// Wait until every client's delivery queue is empty and no handler
    /// published anything further while it drained.
    pub async fn settle(&self) {
        loop {
            let before = self.processed();
            let mut barriers = Vec::new();
            for client in self.live_clients() {
                let (tx, rx) = oneshot::channel();
                if client.enqueue(Delivery::Barrier(tx)) {
                    barriers.push(rx);
                }
            }
            for barrier in barriers {
                let _ = barrier.await;
            }
            if self.processed() == before {
                return;
            }
        }
    }

    fn processed(&self) -> u64 {
        self.live_clients()
            .iter()
            .map(|c| c.processed.load(Ordering::SeqCst))
            .sum()
    }

    fn live_clients(&self) -> Vec<Arc<ClientShared>> {
        let mut clients = self.inner.clients.lock();
        clients.retain(|w| w.strong_count() > 0);
        clients
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.connected.load(Ordering::SeqCst))
            .collect()
    }

    fn retained_matching(&self, filter: &str) -> Vec<Message> {
        self.inner
            .retained
            .lock()
            .values()
            .filter(|m| matches_filter(filter, &m.topic))
            .cloned()
            .collect()
    }
}

struct ClientShared {
    client_id: String,
    routes: RouteTable,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    connected: AtomicBool,
    processed: AtomicU64,
}

impl ClientShared {
    fn enqueue(&self, delivery: Delivery) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Barrier(done) => {
                let _ = done.send(());
            }
            Delivery::Broadcast(message) => {
                if self.connected.load(Ordering::SeqCst) {
                    self.routes.dispatch(&message);
                }
                self.processed.fetch_add(1, Ordering::SeqCst);
            }
            Delivery::Only(route, message) => {
                if self.connected.load(Ordering::SeqCst) {
                    self.routes.dispatch_to(route, &message);
                }
                self.processed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryClient {
    broker: MemoryBroker,
    shared: Arc<ClientShared>,
    published: Mutex<Vec<Message>>,
    disconnects: AtomicUsize,
}

impl MemoryClient {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Every message this client has published, in order.
    pub fn published(&self) -> Vec<Message> {
        self.published.lock().clone()
    }

    /// Messages this client has published to exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// How many times [`Transport::disconnect`] was called on this client.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryClient {
    fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    fn publish(&self, message: Message) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::Transport(format!(
                "client `{}` is disconnected",
                self.shared.client_id
            )));
        }
        trace!(client = %self.shared.client_id, topic = %message.topic, "memory publish");
        self.published.lock().push(message.clone());
        self.broker.publish(message);
        Ok(())
    }

    fn add_route(&self, filter: &str, handler: MessageHandler) -> Result<RouteId, BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::Transport(format!(
                "client `{}` is disconnected",
                self.shared.client_id
            )));
        }
        let id = self.shared.routes.add(filter, handler);
        for message in self.broker.retained_matching(filter) {
            self.shared.enqueue(Delivery::Only(id, message));
        }
        Ok(id)
    }

    fn remove_route(&self, id: RouteId) -> bool {
        self.shared.routes.remove(id).is_some()
    }

    fn route_count(&self) -> usize {
        self.shared.routes.len()
    }

    fn disconnect(&self) -> Result<(), BridgeError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            debug!(client = %self.shared.client_id, "memory client disconnected");
        }
        self.shared.tx.lock().take();
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(client: &MemoryClient, filter: &str) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client
            .add_route(filter, Arc::new(move |m: &Message| sink.lock().push(m.clone())))
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn delivers_to_matching_routes_including_self() {
        let broker = MemoryBroker::new();
        let a = broker.client("a");
        let b = broker.client("b");
        let a_seen = collect(&a, "/dropbot/+/signal/+");
        let b_seen = collect(&b, "/dropbot/+/properties");

        a.publish(Message::new("/dropbot/1/signal/foo", "{}")).unwrap();
        broker.settle().await;

        assert_eq!(a_seen.lock().len(), 1);
        assert!(b_seen.lock().is_empty());
        assert_eq!(a.published_to("/dropbot/1/signal/foo").len(), 1);
    }

    #[tokio::test]
    async fn retained_messages_replay_to_new_routes() {
        let broker = MemoryBroker::new();
        let device = broker.client("device");
        device
            .publish(Message::new("/dropbot/1/properties", r#"{"uuid":"1"}"#).retained(true))
            .unwrap();
        broker.settle().await;

        let late = broker.client("late");
        let seen = collect(&late, "/dropbot/+/properties");
        broker.settle().await;
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].retained);
    }

    #[tokio::test]
    async fn empty_retained_payload_clears() {
        let broker = MemoryBroker::new();
        let device = broker.client("device");
        device
            .publish(Message::new("/dropbot/1/properties", "{}").retained(true))
            .unwrap();
        assert!(broker.retained("/dropbot/1/properties").is_some());
        device
            .publish(Message::new("/dropbot/1/properties", "").retained(true))
            .unwrap();
        assert!(broker.retained("/dropbot/1/properties").is_none());
    }

    #[tokio::test]
    async fn settle_follows_handler_publications() {
        let broker = MemoryBroker::new();
        let echo = broker.client("echo");
        let responder = Arc::clone(&echo);
        echo.add_route(
            "/ping",
            Arc::new(move |_: &Message| {
                responder.publish(Message::new("/pong", "")).unwrap();
            }),
        )
        .unwrap();
        let listener = broker.client("listener");
        let pongs = collect(&listener, "/pong");

        broker.publish(Message::new("/ping", ""));
        broker.settle().await;
        assert_eq!(pongs.lock().len(), 1);
    }

    #[tokio::test]
    async fn disconnected_client_stops_receiving() {
        let broker = MemoryBroker::new();
        let client = broker.client("c");
        let seen = collect(&client, "/#");
        client.disconnect().unwrap();
        client.disconnect().unwrap();
        broker.publish(Message::new("/x", ""));
        broker.settle().await;

        assert!(seen.lock().is_empty());
        assert!(client.publish(Message::new("/x", "")).is_err());
        assert_eq!(client.disconnect_count(), 2);
        assert_eq!(broker.client_count(), 0);
    }
}

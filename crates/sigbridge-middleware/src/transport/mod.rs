//! Transport seam between the bridge/RPC layers and a pub/sub broker.
//!
//! Nothing above this module speaks MQTT directly.  The bridge, the RPC
//! correlator and the monitor publish through [`Transport::publish`] and
//! receive through handlers registered with [`Transport::add_route`].
//!
//! # Implementations
//!
//! - [`MqttTransport`] – a `rumqttc` client whose network loop runs on a
//!   dedicated `mqtt-io` thread.
//! - [`MemoryBroker`] / [`MemoryClient`] – an in-process broker used by tests
//!   and simulations.
//!
//! Both deliver inbound messages to handlers sequentially on a single
//! background thread per client.  A handler that blocks stalls every later
//! delivery for that client.

mod memory;
mod mqtt;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use sigbridge_types::{BridgeError, Message};

use crate::topic::matches_filter;

pub use memory::{MemoryBroker, MemoryClient};
pub use mqtt::{MqttSettings, MqttTransport};

/// Inbound message handler.  Runs on the transport's delivery thread.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identifies one registered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

/// A pub/sub client the bridge can publish through and route from.
pub trait Transport: Send + Sync {
    /// Identity of this client on the broker.
    fn client_id(&self) -> &str;

    /// Queue `message` for delivery.  Never blocks on the network.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the client is disconnected or
    /// its outgoing queue is full.
    fn publish(&self, message: Message) -> Result<(), BridgeError>;

    /// Deliver every inbound message matching `filter` to `handler`.
    fn add_route(&self, filter: &str, handler: MessageHandler) -> Result<RouteId, BridgeError>;

    /// Returns `false` if `id` was not registered.
    fn remove_route(&self, id: RouteId) -> bool;

    /// Number of live routes.
    fn route_count(&self) -> usize;

    /// Stop the client.  Routes stop receiving messages.
    fn disconnect(&self) -> Result<(), BridgeError>;
}

struct Route {
    id: RouteId,
    filter: String,
    handler: MessageHandler,
}

/// Filter → handler table shared by the transport implementations.
#[derive(Default)]
pub struct RouteTable {
    next: AtomicU64,
    routes: RwLock<Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, filter: &str, handler: MessageHandler) -> RouteId {
        let id = RouteId(self.next.fetch_add(1, Ordering::Relaxed));
        self.routes.write().push(Route {
            id,
            filter: filter.to_string(),
            handler,
        });
        id
    }

    /// Remove `id` and return the filter it was registered with.
    pub fn remove(&self, id: RouteId) -> Option<String> {
        let mut routes = self.routes.write();
        let idx = routes.iter().position(|r| r.id == id)?;
        Some(routes.remove(idx).filter)
    }

    /// `true` if any live route uses exactly `filter`.
    pub fn has_filter(&self, filter: &str) -> bool {
        self.routes.read().iter().any(|r| r.filter == filter)
    }

    /// Distinct filters of all live routes.
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.routes.read().iter().map(|r| r.filter.clone()).collect();
        filters.sort();
        filters.dedup();
        filters
    }

    pub fn filter_of(&self, id: RouteId) -> Option<String> {
        self.routes.read().iter().find(|r| r.id == id).map(|r| r.filter.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Invoke every handler whose filter matches `message.topic`.
    ///
    /// Handlers run outside the table lock so they may add or remove routes.
    pub fn dispatch(&self, message: &Message) -> usize {
        let matched: Vec<MessageHandler> = self
            .routes
            .read()
            .iter()
            .filter(|r| matches_filter(&r.filter, &message.topic))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in &matched {
            handler(message);
        }
        matched.len()
    }

    /// Invoke only route `id`, if it is still registered.
    pub fn dispatch_to(&self, id: RouteId, message: &Message) -> bool {
        let handler = self
            .routes
            .read()
            .iter()
            .find(|r| r.id == id)
            .map(|r| Arc::clone(&r.handler));
        match handler {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }
}

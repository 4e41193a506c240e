//! MQTT transport backed by `rumqttc`.
//!
//! The synchronous `rumqttc::Client` queues requests; its `Connection` is
//! polled on a dedicated `mqtt-io` thread which also dispatches inbound
//! publishes to the [`RouteTable`].  Broker subscriptions are reference
//! counted per filter and re-issued after every `ConnAck`, so routes survive
//! reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, RecvTimeoutError};
use sigbridge_types::{BridgeError, Message, QoS};
use tracing::{debug, error, info, trace, warn};

use super::{MessageHandler, RouteId, RouteTable, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connection parameters for [`MqttTransport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Capacity of the outgoing request queue.
    pub capacity: usize,
    /// Extra filter subscribed on every connect, e.g. `/#`.
    pub subscribe_all: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "sigbridge".to_string(),
            keep_alive_secs: 5,
            capacity: 100,
            subscribe_all: None,
        }
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_rumqttc(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

struct Shared {
    client_id: String,
    client: Mutex<Client>,
    routes: RouteTable,
    /// Broker subscriptions, by filter, with the number of routes using each.
    filters: Mutex<HashMap<String, usize>>,
    subscribe_all: Option<String>,
    stop: AtomicBool,
}

impl Shared {
    fn resubscribe(&self) {
        let mut filters: Vec<String> = self.filters.lock().keys().cloned().collect();
        if let Some(all) = &self.subscribe_all {
            filters.push(all.clone());
        }
        let client = self.client.lock();
        for filter in filters {
            if let Err(e) = client.try_subscribe(filter.as_str(), rumqttc::QoS::AtLeastOnce) {
                warn!(filter = %filter, error = %e, "resubscribe failed");
            }
        }
    }

    fn run(&self, mut connection: Connection) {
        while !self.stop.load(Ordering::SeqCst) {
            match connection.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!(client = %self.client_id, "mqtt connected");
                    self.resubscribe();
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let message = Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        qos: from_rumqttc(publish.qos),
                        retained: publish.retain,
                    };
                    let n = self.routes.dispatch(&message);
                    trace!(topic = %message.topic, handlers = n, "mqtt inbound");
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    debug!(client = %self.client_id, "broker sent disconnect");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(client = %self.client_id, error = %e, "mqtt connection error, retrying");
                    self.sleep_unless_stopped(RETRY_DELAY);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(client = %self.client_id, "mqtt request channel closed");
                    break;
                }
            }
        }
        info!(client = %self.client_id, "mqtt io thread stopped");
    }

    fn sleep_unless_stopped(&self, total: Duration) {
        let mut waited = Duration::ZERO;
        while waited < total && !self.stop.load(Ordering::SeqCst) {
            thread::sleep(POLL_INTERVAL);
            waited += POLL_INTERVAL;
        }
    }
}

/// [`Transport`] over a real MQTT broker.
pub struct MqttTransport {
    shared: Arc<Shared>,
    io: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Start the client and its `mqtt-io` thread.  Returns immediately; the
    /// connection is established (and re-established) in the background.
    pub fn connect(settings: MqttSettings) -> Result<Arc<Self>, BridgeError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(1)));
        let (client, connection) = Client::new(options, settings.capacity.max(1));

        let shared = Arc::new(Shared {
            client_id: settings.client_id.clone(),
            client: Mutex::new(client),
            routes: RouteTable::new(),
            filters: Mutex::new(HashMap::new()),
            subscribe_all: settings.subscribe_all.clone(),
            stop: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let io = thread::Builder::new()
            .name("mqtt-io".to_string())
            .spawn(move || worker.run(connection))
            .map_err(|e| BridgeError::Transport(format!("failed to spawn mqtt-io thread: {e}")))?;

        info!(
            client = %settings.client_id,
            host = %settings.host,
            port = settings.port,
            "mqtt transport started"
        );
        Ok(Arc::new(Self {
            shared,
            io: Mutex::new(Some(io)),
        }))
    }
}

impl Transport for MqttTransport {
    fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    fn publish(&self, message: Message) -> Result<(), BridgeError> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("mqtt transport is disconnected".to_string()));
        }
        trace!(topic = %message.topic, retained = message.retained, "mqtt publish");
        self.shared
            .client
            .lock()
            .try_publish(
                message.topic,
                to_rumqttc(message.qos),
                message.retained,
                message.payload,
            )
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    fn add_route(&self, filter: &str, handler: MessageHandler) -> Result<RouteId, BridgeError> {
        let first = {
            let mut filters = self.shared.filters.lock();
            let count = filters.entry(filter.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            debug!(filter = %filter, "mqtt subscribe");
            if let Err(e) = self
                .shared
                .client
                .lock()
                .try_subscribe(filter, rumqttc::QoS::AtLeastOnce)
            {
                let mut filters = self.shared.filters.lock();
                filters.remove(filter);
                return Err(BridgeError::Transport(e.to_string()));
            }
        }
        Ok(self.shared.routes.add(filter, handler))
    }

    fn remove_route(&self, id: RouteId) -> bool {
        let Some(filter) = self.shared.routes.remove(id) else {
            return false;
        };
        let last = {
            let mut filters = self.shared.filters.lock();
            match filters.get_mut(&filter) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    filters.remove(&filter);
                    true
                }
                None => false,
            }
        };
        if last && !self.shared.stop.load(Ordering::SeqCst) {
            debug!(filter = %filter, "mqtt unsubscribe");
            if let Err(e) = self.shared.client.lock().try_unsubscribe(filter.as_str()) {
                warn!(filter = %filter, error = %e, "unsubscribe failed");
            }
        }
        true
    }

    fn route_count(&self) -> usize {
        self.shared.routes.len()
    }

    fn disconnect(&self) -> Result<(), BridgeError> {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.shared.client.lock().try_disconnect() {
            error!(client = %self.shared.client_id, error = %e, "mqtt disconnect request failed");
        }
        let handle = self.io.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            return Err(BridgeError::Transport("mqtt-io thread panicked".to_string()));
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "mqtt transport drop");
        }
    }
}

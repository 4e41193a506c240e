//! Dynamic Proxy: remote device members as local async calls.
//!
//! A [`ProxyClient`] follows a device's retained presence announcement and
//! keeps a [`Correlator`] for whichever instance is currently online.  It
//! also mirrors the device's outbound signals into a local [`Namespace`].
//!
//! A [`DeviceProxy`] checks every access against a [`DeviceShape`] and maps
//! it onto the RPC protocol:
//!
//! | Access | Request |
//! |---|---|
//! | `get(name)` | `property/{name}` with no args |
//! | `set(name, value)` | `property/{name}` with `args = [value]` |
//! | `invoke(name, args, kwargs)` | `call/{name}` |
//!
//! Names outside the shape fail with [`BridgeError::UnknownMember`] without
//! touching the broker.
//!
//! [`BlockingDeviceProxy`] offers the same operations for synchronous callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use sigbridge_hal::DeviceShape;
use sigbridge_middleware::bridge::ORIGIN_FIELD;
use sigbridge_middleware::topic::{self, ParsedTopic, TopicKind};
use sigbridge_middleware::{
    Correlator, DevicePrefix, MqttSettings, MqttTransport, Namespace, RouteId, Transport,
};
use sigbridge_types::{BridgeError, Message, Payload};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Proxy construction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    /// How long to wait for the device's presence announcement.
    pub presence_timeout: Option<Duration>,
    /// Timeout of every remote request.
    pub rpc_timeout: Option<Duration>,
}

struct ClientState {
    device_name: String,
    transport: Arc<dyn Transport>,
    signals: Namespace,
    rpc_timeout: Option<Duration>,
    correlator: Mutex<Option<Arc<Correlator>>>,
    connected: watch::Sender<bool>,
}

impl ClientState {
    fn on_presence(&self, message: &Message) {
        let Ok(ParsedTopic::Presence { device, uuid }) = topic::parse(&message.topic) else {
            return;
        };
        if device != self.device_name {
            return;
        }
        let prefix = match DevicePrefix::new(device, uuid) {
            Ok(prefix) => prefix,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "ignoring presence");
                return;
            }
        };

        let mut current = self.correlator.lock();
        if message.payload.is_empty() {
            if current.as_ref().is_some_and(|c| c.prefix() == &prefix) {
                debug!(prefix = %prefix, "device went offline");
                *current = None;
                self.connected.send_replace(false);
            }
            return;
        }
        if current.as_ref().is_some_and(|c| c.prefix() == &prefix) {
            trace!(prefix = %prefix, "presence repeated");
            self.connected.send_replace(true);
            return;
        }
        debug!(prefix = %prefix, "device online");
        let mut correlator = Correlator::new(Arc::clone(&self.transport), prefix);
        if let Some(timeout) = self.rpc_timeout {
            correlator = correlator.with_timeout(timeout);
        }
        *current = Some(Arc::new(correlator));
        self.connected.send_replace(true);
    }

    fn on_signal(&self, message: &Message) {
        let Ok(ParsedTopic::Member {
            device,
            uuid,
            kind: TopicKind::Signal,
            name,
        }) = topic::parse(&message.topic)
        else {
            return;
        };
        if device != self.device_name {
            return;
        }
        let mut fields: Payload = match serde_json::from_slice(&message.payload) {
            Ok(fields) => fields,
            Err(e) => {
                debug!(topic = %message.topic, error = %e, "dropping undecodable device signal");
                return;
            }
        };
        fields.remove(ORIGIN_FIELD);
        self.signals
            .signal(&name)
            .send(&format!("{device}-{uuid}"), fields);
    }
}

/// Watches one device family on a transport.
pub struct ProxyClient {
    state: Arc<ClientState>,
    routes: Mutex<Vec<RouteId>>,
}

impl ProxyClient {
    /// Follow devices named `device_name` with no request timeout.
    pub fn attach(transport: Arc<dyn Transport>, device_name: &str) -> Result<Self, BridgeError> {
        Self::attach_with(transport, device_name, None)
    }

    pub fn attach_with(
        transport: Arc<dyn Transport>,
        device_name: &str,
        rpc_timeout: Option<Duration>,
    ) -> Result<Self, BridgeError> {
        let state = Arc::new(ClientState {
            device_name: device_name.to_string(),
            transport: Arc::clone(&transport),
            signals: Namespace::new(),
            rpc_timeout,
            correlator: Mutex::new(None),
            connected: watch::channel(false).0,
        });
        let client = Self {
            state: Arc::clone(&state),
            routes: Mutex::new(Vec::new()),
        };

        let presence = Arc::clone(&state);
        let route = transport.add_route(
            &topic::presence_filter(device_name),
            Arc::new(move |m: &Message| presence.on_presence(m)),
        )?;
        client.routes.lock().push(route);

        let mirror = Arc::clone(&state);
        let route = transport.add_route(
            &topic::signal_filter(device_name),
            Arc::new(move |m: &Message| mirror.on_signal(m)),
        )?;
        client.routes.lock().push(route);

        debug!(device_name = %device_name, "proxy client attached");
        Ok(client)
    }

    pub fn device_name(&self) -> &str {
        &self.state.device_name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.state.transport
    }

    /// Signals mirrored from the device, sent as `{device}-{uuid}`.
    pub fn signals(&self) -> &Namespace {
        &self.state.signals
    }

    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    /// Resolve once a presence announcement has been seen.
    pub async fn wait_connected(&self) -> Result<(), BridgeError> {
        let mut connected = self.state.connected.subscribe();
        connected
            .wait_for(|c| *c)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::NotConnected(self.state.device_name.clone()))
    }

    /// Correlator for the device currently online.
    pub fn correlator(&self) -> Result<Arc<Correlator>, BridgeError> {
        self.state
            .correlator
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::NotConnected(self.state.device_name.clone()))
    }

    /// Stop following presence and signals.  Returns `false` if already detached.
    pub fn detach(&self) -> bool {
        let routes = std::mem::take(&mut *self.routes.lock());
        for route in &routes {
            self.state.transport.remove_route(*route);
        }
        *self.state.correlator.lock() = None;
        self.state.connected.send_replace(false);
        !routes.is_empty()
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Async proxy for one remote device.
pub struct DeviceProxy {
    shape: DeviceShape,
    client: Arc<ProxyClient>,
    owns_transport: bool,
    stopped: AtomicBool,
}

impl DeviceProxy {
    /// Wrap an existing client.  The proxy never detaches or disconnects it.
    pub fn new(shape: DeviceShape, client: Arc<ProxyClient>) -> Self {
        Self {
            shape,
            client,
            owns_transport: false,
            stopped: AtomicBool::new(false),
        }
    }

    /// Attach to `transport`, take ownership of it, and wait for the device
    /// to announce itself.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] if `presence_timeout` elapses first.  The
    /// transport is disconnected in that case.
    pub async fn open(
        shape: DeviceShape,
        transport: Arc<dyn Transport>,
        device_name: &str,
        options: ProxyOptions,
    ) -> Result<Self, BridgeError> {
        let client = ProxyClient::attach_with(transport, device_name, options.rpc_timeout)?;
        let proxy = Self {
            shape,
            client: Arc::new(client),
            owns_transport: true,
            stopped: AtomicBool::new(false),
        };
        match options.presence_timeout {
            Some(limit) => tokio::time::timeout(limit, proxy.client.wait_connected())
                .await
                .map_err(|_| {
                    BridgeError::NotConnected(format!(
                        "no presence from `{device_name}` within {} ms",
                        limit.as_millis()
                    ))
                })??,
            None => proxy.client.wait_connected().await?,
        }
        info!(device_name = %device_name, "proxy connected");
        Ok(proxy)
    }

    /// [`DeviceProxy::open`] over a new MQTT connection.
    pub async fn connect(
        shape: DeviceShape,
        settings: MqttSettings,
        device_name: &str,
        options: ProxyOptions,
    ) -> Result<Self, BridgeError> {
        let transport = MqttTransport::connect(settings)?;
        Self::open(shape, transport, device_name, options).await
    }

    pub fn shape(&self) -> &DeviceShape {
        &self.shape
    }

    pub fn client(&self) -> &Arc<ProxyClient> {
        &self.client
    }

    pub fn signals(&self) -> &Namespace {
        self.client.signals()
    }

    pub fn owns_transport(&self) -> bool {
        self.owns_transport
    }

    fn require_property(&self, name: &str) -> Result<Arc<Correlator>, BridgeError> {
        if !self.shape.has_property(name) {
            return Err(BridgeError::UnknownMember(name.to_string()));
        }
        self.client.correlator()
    }

    pub async fn get(&self, name: &str) -> Result<Option<Value>, BridgeError> {
        self.require_property(name)?.property(name).await
    }

    pub async fn set(&self, name: &str, value: Value) -> Result<(), BridgeError> {
        self.require_property(name)?.set_property(name, value).await
    }

    pub async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Payload,
    ) -> Result<Option<Value>, BridgeError> {
        if !self.shape.has_method(name) {
            return Err(BridgeError::UnknownMember(name.to_string()));
        }
        self.client.correlator()?.call(name, args, kwargs).await
    }

    /// Release the proxy.  Only the first call does anything; returns
    /// whether this was it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.owns_transport {
            self.client.detach();
            if let Err(e) = self.client.transport().disconnect() {
                warn!(error = %e, "proxy transport disconnect");
            }
            debug!(device_name = %self.client.device_name(), "proxy stopped");
        }
        true
    }
}

impl Drop for DeviceProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// [`DeviceProxy`] driven by a private current-thread runtime.
///
/// Must not be used from inside another Tokio runtime.
pub struct BlockingDeviceProxy {
    inner: DeviceProxy,
    runtime: tokio::runtime::Runtime,
}

impl BlockingDeviceProxy {
    fn runtime() -> Result<tokio::runtime::Runtime, BridgeError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Transport(format!("failed to build runtime: {e}")))
    }

    pub fn open(
        shape: DeviceShape,
        transport: Arc<dyn Transport>,
        device_name: &str,
        options: ProxyOptions,
    ) -> Result<Self, BridgeError> {
        let runtime = Self::runtime()?;
        let inner = runtime.block_on(DeviceProxy::open(shape, transport, device_name, options))?;
        Ok(Self { inner, runtime })
    }

    pub fn connect(
        shape: DeviceShape,
        settings: MqttSettings,
        device_name: &str,
        options: ProxyOptions,
    ) -> Result<Self, BridgeError> {
        let runtime = Self::runtime()?;
        let inner = runtime.block_on(DeviceProxy::connect(shape, settings, device_name, options))?;
        Ok(Self { inner, runtime })
    }

    pub fn get(&self, name: &str) -> Result<Option<Value>, BridgeError> {
        self.runtime.block_on(self.inner.get(name))
    }

    pub fn set(&self, name: &str, value: Value) -> Result<(), BridgeError> {
        self.runtime.block_on(self.inner.set(name, value))
    }

    pub fn invoke(&self, name: &str, args: Vec<Value>, kwargs: Payload) -> Result<Option<Value>, BridgeError> {
        self.runtime.block_on(self.inner.invoke(name, args, kwargs))
    }

    pub fn shape(&self) -> &DeviceShape {
        self.inner.shape()
    }

    pub fn signals(&self) -> &Namespace {
        self.inner.signals()
    }

    pub fn stop(&self) -> bool {
        self.inner.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Monitor, MonitorConfig};
    use serde_json::json;
    use sigbridge_hal::{SimDevice, SimPlug, SimSource};
    use sigbridge_middleware::MemoryBroker;

    const WAIT: Duration = Duration::from_secs(5);

    fn options() -> ProxyOptions {
        ProxyOptions {
            presence_timeout: Some(WAIT),
            rpc_timeout: Some(WAIT),
        }
    }

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        }
    }

    fn start_device(broker: &MemoryBroker) -> (Arc<SimDevice>, SimPlug, Monitor) {
        let device = Arc::new(SimDevice::with_uuid("1234"));
        let (plug, source) = SimSource::attached(device.clone());
        let monitor = Monitor::spawn(source, broker.client("dropbot-monitor"), monitor_config());
        (device, plug, monitor)
    }

    #[tokio::test]
    async fn proxy_round_trips_through_a_monitored_device() {
        let broker = MemoryBroker::new();
        let (_device, _plug, monitor) = start_device(&broker);
        let proxy = DeviceProxy::open(SimDevice::device_shape(), broker.client("proxy"), "dropbot", options())
            .await
            .unwrap();

        assert_eq!(proxy.get("voltage").await.unwrap(), Some(json!(100.0)));
        proxy.set("voltage", json!(80)).await.unwrap();
        assert_eq!(proxy.get("voltage").await.unwrap(), Some(json!(80.0)));

        let mut kwargs = Payload::new();
        kwargs.insert("capacitance_update_interval_ms".into(), json!(0));
        assert_eq!(
            proxy.invoke("update_state", vec![], kwargs).await.unwrap(),
            Some(json!(true))
        );

        proxy.stop();
        monitor.stop().await;
    }

    #[tokio::test]
    async fn undeclared_members_fail_locally() {
        let broker = MemoryBroker::new();
        let (_device, _plug, monitor) = start_device(&broker);
        let transport = broker.client("proxy");
        let shape = DeviceShape::new().with_property("voltage").with_method("measure_capacitance");
        let proxy = DeviceProxy::open(shape, transport.clone(), "dropbot", options())
            .await
            .unwrap();

        assert_eq!(
            proxy.get("frequency").await.unwrap_err(),
            BridgeError::UnknownMember("frequency".to_string())
        );
        assert_eq!(
            proxy.invoke("voltage", vec![], Payload::new()).await.unwrap_err(),
            BridgeError::UnknownMember("voltage".to_string())
        );
        assert_eq!(
            proxy.set("measure_capacitance", json!(1)).await.unwrap_err(),
            BridgeError::UnknownMember("measure_capacitance".to_string())
        );
        assert!(transport.published().is_empty());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn presence_clear_disconnects_the_proxy() {
        let broker = MemoryBroker::new();
        let (_device, plug, monitor) = start_device(&broker);
        let proxy = DeviceProxy::open(SimDevice::device_shape(), broker.client("proxy"), "dropbot", options())
            .await
            .unwrap();
        assert!(proxy.client().is_connected());

        plug.detach();
        tokio::time::timeout(WAIT, async {
            while proxy.client().is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            proxy.get("voltage").await,
            Err(BridgeError::NotConnected(_))
        ));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn device_signals_are_mirrored_locally() {
        let broker = MemoryBroker::new();
        let (device, _plug, monitor) = start_device(&broker);
        let proxy = DeviceProxy::open(SimDevice::device_shape(), broker.client("proxy"), "dropbot", options())
            .await
            .unwrap();
        let mut updates = proxy.signals().signal("channels-updated").subscribe();

        proxy
            .invoke("set_state_of_channels", vec![json!([7])], Payload::new())
            .await
            .unwrap();
        let emission = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(emission.sender, "dropbot-1234");
        assert_eq!(emission.fields["active"], json!([7]));
        assert_eq!(device.active_channels(), vec![7]);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn repeated_presence_keeps_calls_queued() {
        let broker = MemoryBroker::new();
        let transport = broker.client("proxy");
        let client = ProxyClient::attach(transport.clone(), "dropbot").unwrap();
        let presence = Message::new("/dropbot/1234/properties", "{}").retained(true);
        broker.publish(presence.clone());
        tokio::time::timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        let first = client.correlator().unwrap();
        let pending = Arc::clone(&first);
        let a = tokio::spawn(async move { pending.call("echo", vec![json!(1)], Payload::new()).await });
        while first.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        // Same instance announces itself again, e.g. a retained replay.
        broker.publish(presence);
        broker.settle().await;
        let second = client.correlator().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let b = tokio::spawn(async move { second.call("echo", vec![json!(2)], Payload::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(Message::new("/dropbot/1234/result/echo", "1"));
        assert_eq!(tokio::time::timeout(WAIT, a).await.unwrap().unwrap().unwrap(), Some(json!(1)));

        tokio::time::timeout(WAIT, async {
            while transport.published_to("/dropbot/1234/call/echo").len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!b.is_finished());
        broker.publish(Message::new("/dropbot/1234/result/echo", "2"));
        assert_eq!(tokio::time::timeout(WAIT, b).await.unwrap().unwrap().unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn new_instance_replaces_the_correlator() {
        let broker = MemoryBroker::new();
        let client = ProxyClient::attach(broker.client("proxy"), "dropbot").unwrap();
        broker.publish(Message::new("/dropbot/1234/properties", "{}").retained(true));
        tokio::time::timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
        let first = client.correlator().unwrap();

        broker.publish(Message::new("/dropbot/5678/properties", "{}").retained(true));
        broker.settle().await;
        let second = client.correlator().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.prefix().to_string(), "/dropbot/5678");
    }

    #[tokio::test]
    async fn owning_proxy_stops_exactly_once() {
        let broker = MemoryBroker::new();
        let (_device, _plug, monitor) = start_device(&broker);
        let transport = broker.client("proxy");
        let proxy = DeviceProxy::open(SimDevice::device_shape(), transport.clone(), "dropbot", options())
            .await
            .unwrap();
        assert!(proxy.owns_transport());

        assert!(proxy.stop());
        assert!(!proxy.stop());
        drop(proxy);
        assert_eq!(transport.disconnect_count(), 1);
        assert_eq!(transport.route_count(), 0);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn wrapping_proxy_leaves_the_client_alone() {
        let broker = MemoryBroker::new();
        let (_device, _plug, monitor) = start_device(&broker);
        let transport = broker.client("shared");
        let client = Arc::new(ProxyClient::attach(transport.clone(), "dropbot").unwrap());
        tokio::time::timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        let proxy = DeviceProxy::new(SimDevice::device_shape(), Arc::clone(&client));
        assert_eq!(proxy.get("channel_count").await.unwrap(), Some(json!(120)));
        drop(proxy);

        assert_eq!(transport.disconnect_count(), 0);
        assert!(client.is_connected());
        assert_eq!(transport.route_count(), 2);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn missing_presence_times_out_and_releases_the_transport() {
        let broker = MemoryBroker::new();
        let transport = broker.client("proxy");
        let err = DeviceProxy::open(
            SimDevice::device_shape(),
            transport.clone(),
            "dropbot",
            ProxyOptions {
                presence_timeout: Some(Duration::from_millis(50)),
                rpc_timeout: None,
            },
        )
        .await
        .err()
        .expect("open must fail");
        assert!(matches!(err, BridgeError::NotConnected(_)));
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[test]
    fn blocking_proxy_from_synchronous_code() {
        let device_runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        let (_device, _plug, monitor) = device_runtime.block_on(async { start_device(&broker) });

        let proxy = BlockingDeviceProxy::open(
            SimDevice::device_shape(),
            broker.client("blocking"),
            "dropbot",
            options(),
        )
        .unwrap();
        proxy.set("frequency", json!(5000)).unwrap();
        assert_eq!(proxy.get("frequency").unwrap(), Some(json!(5000.0)));
        assert!(proxy.invoke("measure_capacitance", vec![], Payload::new()).unwrap().is_some());
        assert!(proxy.stop());

        device_runtime.block_on(monitor.stop());
    }
}

//! Connection Monitor: publishes an attached device onto the broker.
//!
//! A [`Monitor`] runs a Tokio task that polls a [`DeviceSource`].  When a
//! device attaches it:
//!
//! 1. answers remote `call`/`property` requests for the device
//!    ([`RpcDispatcher`]);
//! 2. binds the monitor's signal namespace to
//!    `/{device}/{uuid}/signal` (outbound) and `/{device}/{uuid}/signal-send`
//!    (inbound);
//! 3. re-arms the device's event notifications;
//! 4. publishes a retained presence announcement on `/{device}/{uuid}/properties`;
//! 5. exposes a [`Correlator`] scoped to the device prefix;
//! 6. emits the local `connected` signal with the `device_id`.
//!
//! Detaching undoes all of it in reverse and emits `disconnected`.
//! Cancellation is checked between polls and always runs the same cleanup.
//!
//! # Phases
//!
//! `Idle` until the first attach, `Connecting` while a device is being set
//! up, `Connected`, then `Disconnected` until the next attach.  `Cancelled`
//! is terminal.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use sigbridge_hal::{Device, DeviceEvent, DeviceSource};
use sigbridge_middleware::{
    BridgeHandle, Correlator, DevicePrefix, DispatcherHandle, MqttSettings, MqttTransport, Namespace,
    RpcDispatcher, SignalBridge, Transport,
};
use sigbridge_types::{BridgeError, Message, Payload};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CONNECTED_SIGNAL: &str = "connected";
pub const DISCONNECTED_SIGNAL: &str = "disconnected";

/// Monitor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// First topic segment, e.g. `dropbot`.
    pub device_name: String,
    /// How often queued device events are forwarded.
    pub poll_interval: Duration,
    /// Timeout applied to the monitor's own [`Correlator`].
    pub rpc_timeout: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_name: "dropbot".to_string(),
            poll_interval: Duration::from_millis(250),
            rpc_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Cancelled,
}

/// Everything owned while one device is attached.
struct Session {
    device: Arc<dyn Device>,
    prefix: DevicePrefix,
    dispatcher: DispatcherHandle,
    bridge: BridgeHandle,
}

struct Shared {
    config: MonitorConfig,
    transport: Arc<dyn Transport>,
    signals: Namespace,
    phase: watch::Sender<MonitorPhase>,
    connected: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
    correlator: Mutex<Option<Arc<Correlator>>>,
    device_id: Mutex<Option<String>>,
}

impl Shared {
    fn set_phase(&self, phase: MonitorPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "monitor phase");
        }
    }

    fn on_connected(&self, device: Arc<dyn Device>) {
        if self.session.lock().is_some() {
            warn!("device attached while another is connected; releasing the old one");
            self.release();
        }
        self.set_phase(MonitorPhase::Connecting);
        let uuid = device.uuid();
        if let Err(e) = self.open_session(device) {
            error!(device_id = %uuid, error = %e, "failed to bring device online");
            self.set_phase(MonitorPhase::Disconnected);
        }
    }

    fn open_session(&self, device: Arc<dyn Device>) -> Result<(), BridgeError> {
        let uuid = device.uuid();
        let prefix = DevicePrefix::new(self.config.device_name.as_str(), uuid.as_str())?;

        let dispatcher = RpcDispatcher::attach(Arc::clone(&self.transport), prefix.clone(), device.clone())?;
        let bridge = SignalBridge::bind(
            &self.signals,
            Arc::clone(&self.transport),
            &prefix.signal_prefix(),
            &prefix.signal_send_prefix(),
        )?;
        if let Err(e) = device.arm_events() {
            warn!(device_id = %uuid, error = %e, "could not arm device events");
        }
        let presence = serde_json::to_vec(&device.describe()?)?;
        self.transport
            .publish(Message::new(prefix.presence(), presence).retained(true))?;

        let mut correlator = Correlator::new(Arc::clone(&self.transport), prefix.clone());
        if let Some(timeout) = self.config.rpc_timeout {
            correlator = correlator.with_timeout(timeout);
        }
        *self.correlator.lock() = Some(Arc::new(correlator));
        *self.device_id.lock() = Some(uuid.clone());
        let sender = prefix.sender_id();
        *self.session.lock() = Some(Session {
            device,
            prefix,
            dispatcher,
            bridge,
        });
        self.connected.send_replace(true);
        self.set_phase(MonitorPhase::Connected);
        info!(device_id = %uuid, "device connected");

        let mut fields = Payload::new();
        fields.insert("device_id".to_string(), json!(uuid));
        self.signals.signal(CONNECTED_SIGNAL).send(&sender, fields);
        Ok(())
    }

    /// Tear down the current session, if any.  Safe to call repeatedly.
    fn release(&self) -> bool {
        let Some(session) = self.session.lock().take() else {
            return false;
        };
        self.connected.send_replace(false);
        *self.correlator.lock() = None;
        if let Err(e) = session.bridge.unbind() {
            warn!(error = %e, "bridge unbind");
        }
        session.dispatcher.detach();
        if let Err(e) = self
            .transport
            .publish(Message::new(session.prefix.presence(), Vec::new()).retained(true))
        {
            warn!(error = %e, "could not clear presence");
        }
        self.set_phase(MonitorPhase::Disconnected);

        let uuid = session.prefix.uuid().to_string();
        info!(device_id = %uuid, "device disconnected");
        let mut fields = Payload::new();
        fields.insert("device_id".to_string(), json!(uuid));
        self.signals
            .signal(DISCONNECTED_SIGNAL)
            .send(&session.prefix.sender_id(), fields);
        true
    }

    fn forward_device_events(&self) {
        let Some((device, sender)) = self
            .session
            .lock()
            .as_ref()
            .map(|s| (Arc::clone(&s.device), s.prefix.sender_id()))
        else {
            return;
        };
        for event in device.take_events() {
            self.signals.signal(&event.name).send(&sender, event.fields);
        }
    }

    fn current_device(&self) -> Option<Arc<dyn Device>> {
        self.session.lock().as_ref().map(|s| Arc::clone(&s.device))
    }
}

async fn run(shared: Arc<Shared>, mut source: Box<dyn DeviceSource>, token: CancellationToken) {
    let mut ticks = tokio::time::interval(shared.config.poll_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut source_open = true;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = source.poll(), if source_open => match event {
                Ok(Some(DeviceEvent::Attached(device))) => shared.on_connected(device),
                Ok(Some(DeviceEvent::Detached)) => {
                    shared.release();
                }
                Ok(None) => {
                    info!("device source exhausted");
                    source_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "device source error");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(shared.config.poll_interval) => {}
                    }
                }
            },
            _ = ticks.tick() => shared.forward_device_events(),
        }
    }

    shared.release();
    info!("monitor stopped");
}

/// Handle to a running connection monitor.
pub struct Monitor {
    shared: Arc<Shared>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    owns_transport: bool,
}

impl Monitor {
    /// Start monitoring `source` over an existing transport.  The transport
    /// is left connected by [`Monitor::stop`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(source: S, transport: Arc<dyn Transport>, config: MonitorConfig) -> Self
    where
        S: DeviceSource + 'static,
    {
        Self::start(Box::new(source), transport, config, false)
    }

    /// Connect a new MQTT transport and start monitoring over it.  The
    /// transport is disconnected by [`Monitor::stop`].
    pub fn connect<S>(source: S, settings: MqttSettings, config: MonitorConfig) -> Result<Self, BridgeError>
    where
        S: DeviceSource + 'static,
    {
        let transport = MqttTransport::connect(settings)?;
        Ok(Self::start(Box::new(source), transport, config, true))
    }

    fn start(
        source: Box<dyn DeviceSource>,
        transport: Arc<dyn Transport>,
        config: MonitorConfig,
        owns_transport: bool,
    ) -> Self {
        info!(
            device_name = %config.device_name,
            client = %transport.client_id(),
            "starting monitor"
        );
        let shared = Arc::new(Shared {
            config,
            transport,
            signals: Namespace::new(),
            phase: watch::channel(MonitorPhase::Idle).0,
            connected: watch::channel(false).0,
            session: Mutex::new(None),
            correlator: Mutex::new(None),
            device_id: Mutex::new(None),
        });
        let token = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&shared), source, token.clone()));
        Self {
            shared,
            token,
            task: Some(task),
            owns_transport,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        *self.shared.phase.borrow()
    }

    /// Watch phase changes.
    pub fn phases(&self) -> watch::Receiver<MonitorPhase> {
        self.shared.phase.subscribe()
    }

    /// UUID of the current device, or of the last one seen.
    pub fn device_id(&self) -> Option<String> {
        self.shared.device_id.lock().clone()
    }

    /// RPC accessor for the connected device; `None` while disconnected.
    pub fn correlator(&self) -> Option<Arc<Correlator>> {
        self.shared.correlator.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Resolve once a device is connected.
    pub async fn wait_connected(&self) -> Result<(), BridgeError> {
        let mut connected = self.shared.connected.subscribe();
        connected
            .wait_for(|c| *c)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::NotConnected("monitor stopped".to_string()))
    }

    /// The monitor's local signal namespace.
    pub fn signals(&self) -> &Namespace {
        &self.shared.signals
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Quiesce the device, cancel the task, release everything it bound and
    /// disconnect the transport if this monitor created it.
    pub async fn stop(mut self) {
        if let Some(device) = self.shared.current_device()
            && let Err(e) = device.quiesce()
        {
            warn!(error = %e, "device quiesce failed");
        }
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "monitor task failed");
        }
        self.shared.release();
        self.shared.set_phase(MonitorPhase::Cancelled);
        if self.owns_transport
            && let Err(e) = self.shared.transport.disconnect()
        {
            warn!(error = %e, "transport disconnect");
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("phase", &self.phase())
            .field("device_id", &self.device_id())
            .field("owns_transport", &self.owns_transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sigbridge_hal::{SimDevice, SimPlug, SimSource};
    use sigbridge_middleware::{MemoryBroker, MemoryClient, RpcTarget};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        client: Arc<MemoryClient>,
        device: Arc<SimDevice>,
        plug: SimPlug,
        monitor: Monitor,
    }

    async fn connected() -> Fixture {
        let broker = MemoryBroker::new();
        let client = broker.client("dropbot-monitor");
        let device = Arc::new(SimDevice::with_uuid("1234"));
        let (plug, source) = SimSource::attached(device.clone());
        let monitor = Monitor::spawn(source, client.clone(), config());
        tokio::time::timeout(WAIT, monitor.wait_connected())
            .await
            .expect("device never connected")
            .unwrap();
        Fixture {
            broker,
            client,
            device,
            plug,
            monitor,
        }
    }

    async fn wait_phase(monitor: &Monitor, phase: MonitorPhase) {
        let mut phases = monitor.phases();
        tokio::time::timeout(WAIT, phases.wait_for(|p| *p == phase))
            .await
            .expect("phase not reached")
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met");
    }

    #[tokio::test]
    async fn attach_brings_the_device_online() {
        let fx = connected().await;
        assert_eq!(fx.monitor.phase(), MonitorPhase::Connected);
        assert_eq!(fx.monitor.device_id().as_deref(), Some("1234"));
        assert!(fx.monitor.correlator().is_some());
        assert_ne!(fx.device.get_property("event_mask").unwrap(), json!(0));

        let presence = fx.broker.retained("/dropbot/1234/properties").expect("presence");
        let body: Value = serde_json::from_slice(&presence.payload).unwrap();
        assert_eq!(body["uuid"], json!("1234"));
        assert_eq!(body["voltage"], json!(100.0));
        fx.monitor.stop().await;
    }

    #[tokio::test]
    async fn connected_signal_carries_device_id() {
        let broker = MemoryBroker::new();
        let client = broker.client("dropbot-monitor");
        let (_plug, source) = SimSource::attached(Arc::new(SimDevice::with_uuid("abcd")));
        let monitor = Monitor::spawn(source, client, config());
        let mut connected = monitor.signals().signal(CONNECTED_SIGNAL).subscribe();

        let emission = tokio::time::timeout(WAIT, connected.recv()).await.unwrap().unwrap();
        assert_eq!(emission.sender, "dropbot-abcd");
        assert_eq!(emission.fields["device_id"], json!("abcd"));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn correlator_reaches_the_device_through_the_broker() {
        let fx = connected().await;
        let rpc = fx.monitor.correlator().unwrap();

        rpc.set_property("voltage", json!(80)).await.unwrap();
        assert_eq!(rpc.property("voltage").await.unwrap(), Some(json!(80.0)));

        let mut kwargs = Payload::new();
        kwargs.insert("capacitance_update_interval_ms".into(), json!(0));
        assert_eq!(rpc.call("update_state", vec![], kwargs).await.unwrap(), Some(json!(true)));
        fx.monitor.stop().await;
    }

    #[tokio::test]
    async fn detach_leaves_nothing_behind() {
        let fx = connected().await;
        assert!(fx.client.route_count() > 0);

        let mut disconnected = fx.monitor.signals().signal(DISCONNECTED_SIGNAL).subscribe();
        fx.plug.detach();
        wait_phase(&fx.monitor, MonitorPhase::Disconnected).await;

        assert!(!fx.monitor.is_connected());
        assert!(fx.monitor.correlator().is_none());
        assert_eq!(fx.client.route_count(), 0);
        assert!(!fx.monitor.signals().is_bound());
        assert!(fx.broker.retained("/dropbot/1234/properties").is_none());
        let emission = tokio::time::timeout(WAIT, disconnected.recv()).await.unwrap().unwrap();
        assert_eq!(emission.fields["device_id"], json!("1234"));

        // A new device can take its place.
        fx.plug.attach(Arc::new(SimDevice::with_uuid("5678")));
        tokio::time::timeout(WAIT, fx.monitor.wait_connected()).await.unwrap().unwrap();
        assert_eq!(fx.monitor.device_id().as_deref(), Some("5678"));
        fx.monitor.stop().await;
    }

    #[tokio::test]
    async fn device_events_are_forwarded_to_the_broker() {
        let fx = connected().await;
        fx.device
            .invoke("set_state_of_channels", &[json!([4, 5])], &Payload::new())
            .unwrap();

        let client = fx.client.clone();
        eventually(move || !client.published_to("/dropbot/1234/signal/channels-updated").is_empty()).await;
        let published = fx.client.published_to("/dropbot/1234/signal/channels-updated");
        let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["active"], json!([4, 5]));
        assert_eq!(body["__sender__"], json!("dropbot-1234"));
        fx.monitor.stop().await;
    }

    #[tokio::test]
    async fn signal_send_topic_reaches_local_receivers() {
        let fx = connected().await;
        let mut foo = fx.monitor.signals().signal("foo").subscribe();

        fx.broker.publish(Message::new(
            "/dropbot/1234/signal-send/foo",
            r#"{"foobar": "hello, world!"}"#,
        ));
        let emission = tokio::time::timeout(WAIT, foo.recv()).await.unwrap().unwrap();
        assert_eq!(emission.sender, "dropbot-monitor");
        assert_eq!(emission.fields["foobar"], json!("hello, world!"));
        fx.monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_quiesces_and_cleans_up_without_disconnecting_a_borrowed_transport() {
        let fx = connected().await;
        fx.device.set_property("hv_output_enabled", json!(true)).unwrap();

        fx.monitor.stop().await;
        assert_eq!(fx.device.get_property("hv_output_enabled").unwrap(), json!(false));
        assert_eq!(fx.client.route_count(), 0);
        assert!(fx.broker.retained("/dropbot/1234/properties").is_none());
        assert_eq!(fx.client.disconnect_count(), 0);
        assert!(fx.client.is_connected());
    }

    #[tokio::test]
    async fn dropping_the_monitor_releases_the_device() {
        let fx = connected().await;
        let mut phases = fx.monitor.phases();
        let signals = fx.monitor.signals().clone();
        assert!(fx.client.route_count() > 0);

        drop(fx.monitor);
        tokio::time::timeout(WAIT, phases.wait_for(|p| *p == MonitorPhase::Disconnected))
            .await
            .expect("monitor task never released the device")
            .unwrap();

        let client = fx.client.clone();
        eventually(move || client.route_count() == 0).await;
        fx.broker.settle().await;
        assert!(fx.broker.retained("/dropbot/1234/properties").is_none());
        assert!(!signals.is_bound());
        assert_eq!(fx.client.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_source_keeps_the_device_online() {
        let fx = connected().await;
        drop(fx.plug);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.monitor.phase(), MonitorPhase::Connected);

        let mut phases = fx.monitor.phases();
        fx.monitor.stop().await;
        assert_eq!(*phases.borrow_and_update(), MonitorPhase::Cancelled);
    }
}

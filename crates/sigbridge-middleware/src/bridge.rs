//! Signal Bridge: mirrors a local [`Namespace`] onto a [`Transport`].
//!
//! Every signal in the namespace, including signals first looked up after
//! [`SignalBridge::bind`], gets two callbacks:
//!
//! - **outbound**: a receiver that serialises each emission, tags it with
//!   `__sender__` (the emitter) and `__origin__` (this client's identity), and
//!   publishes it to `{forward_prefix}/{name}` at QoS 0;
//! - **inbound**: a transport route on `{inbound_prefix}/{name}` that decodes
//!   the JSON object and re-emits it locally with an extra `__topic__` field.
//!
//! Inbound messages whose `__origin__` or `__sender__` equals this client's
//! identity are dropped, and an emission the bridge itself re-emitted is never published
//! back out through the same binding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use sigbridge_types::{BridgeError, Message, Payload, QoS};
use tracing::{debug, error, info, warn};

use crate::bus::{Emission, Namespace, ReceiverId, Signal};
use crate::topic::join;
use crate::transport::{RouteId, Transport};

/// Field carrying the emitting identity on the wire.
pub const SENDER_FIELD: &str = "__sender__";
/// Field carrying the publishing bridge's transport identity.
pub const ORIGIN_FIELD: &str = "__origin__";
/// Field added to inbound re-emissions, set to the inbound topic.
pub const TOPIC_FIELD: &str = "__topic__";

static NEXT_BINDING: AtomicU64 = AtomicU64::new(1);

struct SignalBinding {
    signal: Signal,
    receiver: ReceiverId,
    route: RouteId,
    topic: String,
}

struct BindingState {
    id: u64,
    namespace: Namespace,
    transport: Arc<dyn Transport>,
    identity: String,
    forward_prefix: String,
    inbound_prefix: String,
    bindings: Mutex<HashMap<String, SignalBinding>>,
    bound: AtomicBool,
}

impl BindingState {
    /// Install both callbacks on `signal`.  A no-op for signals already wired.
    fn wire(self: &Arc<Self>, signal: &Signal) {
        if !self.bound.load(Ordering::SeqCst) {
            return;
        }
        let name = signal.name().to_string();
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&name) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let receiver = signal.connect(move |emission: &Emission| {
            if let Some(state) = weak.upgrade() {
                state.forward(emission);
            }
        });

        let topic = join(&self.inbound_prefix, &name);
        let weak: Weak<Self> = Arc::downgrade(self);
        let target = signal.clone();
        let route = match self.transport.add_route(
            &topic,
            Arc::new(move |message: &Message| {
                if let Some(state) = weak.upgrade() {
                    state.relay(&target, message);
                }
            }),
        ) {
            Ok(route) => route,
            Err(e) => {
                signal.disconnect(receiver);
                error!(signal = %name, topic = %topic, error = %e, "failed to route inbound signal");
                return;
            }
        };

        debug!(signal = %name, inbound = %topic, "signal wired");
        bindings.insert(
            name,
            SignalBinding {
                signal: signal.clone(),
                receiver,
                route,
                topic,
            },
        );
    }

    fn forward(&self, emission: &Emission) {
        if emission.relayed_by == Some(self.id) {
            return;
        }
        let topic = join(&self.forward_prefix, &emission.signal);
        let mut fields = emission.fields.clone();
        fields.insert(SENDER_FIELD.to_string(), Value::String(emission.sender.clone()));
        fields.insert(ORIGIN_FIELD.to_string(), Value::String(self.identity.clone()));
        let payload = match serde_json::to_vec(&fields) {
            Ok(payload) => payload,
            Err(e) => {
                error!(signal = %emission.signal, error = %e, "error serializing signal payload");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .publish(Message::new(topic.clone(), payload).with_qos(QoS::AtMostOnce))
        {
            error!(signal = %emission.signal, topic = %topic, error = %e, "error publishing signal");
        }
    }

    fn relay(&self, signal: &Signal, message: &Message) {
        let mut fields: Payload = match serde_json::from_slice(&message.payload) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(
                    signal = %signal.name(),
                    topic = %message.topic,
                    error = %e,
                    "dropping undecodable signal payload"
                );
                return;
            }
        };
        if fields
            .remove(ORIGIN_FIELD)
            .is_some_and(|origin| origin.as_str() == Some(self.identity.as_str()))
        {
            debug!(topic = %message.topic, "dropping own echo");
            return;
        }
        let sender = match fields.remove(SENDER_FIELD) {
            Some(Value::String(origin)) if origin == self.identity => {
                debug!(topic = %message.topic, "dropping own echo");
                return;
            }
            Some(Value::String(origin)) => origin,
            Some(other) => other.to_string(),
            None => self.identity.clone(),
        };
        fields.insert(TOPIC_FIELD.to_string(), Value::String(message.topic.clone()));
        signal.emit(Emission {
            signal: signal.name().to_string(),
            sender,
            fields,
            relayed_by: Some(self.id),
        });
    }

    fn release(&self) -> Result<(), BridgeError> {
        if !self.bound.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::NotBound);
        }
        let removed = self.namespace.remove_hook();
        let bindings: Vec<SignalBinding> = self.bindings.lock().drain().map(|(_, b)| b).collect();
        for binding in &bindings {
            binding.signal.disconnect(binding.receiver);
            if !self.transport.remove_route(binding.route) {
                debug!(topic = %binding.topic, "inbound route already gone");
            }
        }
        info!(client = %self.identity, signals = bindings.len(), "signal namespace unbound");
        removed
    }
}

/// Result of [`SignalBridge::bind`].  Dropping a bound handle unbinds it.
pub struct BridgeHandle {
    state: Arc<BindingState>,
}

impl BridgeHandle {
    /// Tear down every callback installed by `bind`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotBound`] on every call after the first.
    pub fn unbind(&self) -> Result<(), BridgeError> {
        self.state.release()
    }

    pub fn is_bound(&self) -> bool {
        self.state.bound.load(Ordering::SeqCst)
    }

    /// Names of the signals currently wired, sorted.
    pub fn bound_signals(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.bindings.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// The transport identity used for loop prevention.
    pub fn identity(&self) -> &str {
        &self.state.identity
    }

    pub fn forward_prefix(&self) -> &str {
        &self.state.forward_prefix
    }

    pub fn inbound_prefix(&self) -> &str {
        &self.state.inbound_prefix
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if self.is_bound() {
            let _ = self.state.release();
        }
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("identity", &self.state.identity)
            .field("forward_prefix", &self.state.forward_prefix)
            .field("inbound_prefix", &self.state.inbound_prefix)
            .field("bound", &self.is_bound())
            .finish()
    }
}

pub struct SignalBridge;

impl SignalBridge {
    /// Bind `namespace` to `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AlreadyBound`] if another bridge already owns
    /// the namespace.
    pub fn bind(
        namespace: &Namespace,
        transport: Arc<dyn Transport>,
        forward_prefix: &str,
        inbound_prefix: &str,
    ) -> Result<BridgeHandle, BridgeError> {
        let identity = transport.client_id().to_string();
        let state = Arc::new(BindingState {
            id: NEXT_BINDING.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.clone(),
            transport,
            identity: identity.clone(),
            forward_prefix: forward_prefix.to_string(),
            inbound_prefix: inbound_prefix.to_string(),
            bindings: Mutex::new(HashMap::new()),
            bound: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&state);
        let existing = namespace.install_hook(
            &identity,
            Arc::new(move |signal: &Signal| {
                if let Some(state) = weak.upgrade() {
                    state.wire(signal);
                }
            }),
        )?;
        for signal in &existing {
            state.wire(signal);
        }

        info!(
            client = %identity,
            forward = %forward_prefix,
            inbound = %inbound_prefix,
            signals = existing.len(),
            "signal namespace bound"
        );
        Ok(BridgeHandle { state })
    }

    /// Same as [`BridgeHandle::unbind`].
    pub fn unbind(handle: &BridgeHandle) -> Result<(), BridgeError> {
        handle.unbind()
    }
}

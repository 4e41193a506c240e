//! Local publish/subscribe signal namespace.
//!
//! A [`Namespace`] maps names to [`Signal`]s and creates them lazily on first
//! lookup.  Emitting a signal invokes every connected receiver synchronously,
//! in connection order, with the sender identity and a keyword [`Payload`].
//!
//! Receivers are invoked outside of any internal lock, so a receiver may
//! connect, disconnect or emit other signals.
//!
//! Async consumers can call [`Signal::subscribe`] to get a Tokio channel of
//! [`Emission`]s instead of registering a closure.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sigbridge_types::{BridgeError, Payload};
use tokio::sync::mpsc;

/// Identifies one receiver connected to a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

/// One emission of a signal, as seen by its receivers.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub signal: String,
    pub sender: String,
    pub fields: Payload,
    /// Set when a bridge re-emitted this from an inbound message.
    pub(crate) relayed_by: Option<u64>,
}

/// Receiver callback.
pub type Receiver = Arc<dyn Fn(&Emission) + Send + Sync>;

/// Callback run once for every signal created while a bridge is bound.
pub(crate) type CreationHook = Arc<dyn Fn(&Signal) + Send + Sync>;

static NEXT_RECEIVER: AtomicU64 = AtomicU64::new(1);

struct SignalInner {
    name: String,
    receivers: Mutex<Vec<(ReceiverId, Receiver)>>,
}

/// A named local publish/subscribe channel.  Clones share receivers.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                name: name.to_string(),
                receivers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Connect `receiver`; it stays connected until [`Signal::disconnect`].
    pub fn connect<F>(&self, receiver: F) -> ReceiverId
    where
        F: Fn(&Emission) + Send + Sync + 'static,
    {
        let id = ReceiverId(NEXT_RECEIVER.fetch_add(1, Ordering::Relaxed));
        self.inner.receivers.lock().push((id, Arc::new(receiver)));
        id
    }

    /// Returns `false` if `id` was not connected to this signal.
    pub fn disconnect(&self, id: ReceiverId) -> bool {
        let mut receivers = self.inner.receivers.lock();
        let before = receivers.len();
        receivers.retain(|(rid, _)| *rid != id);
        receivers.len() != before
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.receivers.lock().len()
    }

    /// Connect a channel-backed receiver.
    ///
    /// The receiver disconnects itself on the first emission after the
    /// returned channel is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Emission> {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.inner);
        let slot: Arc<Mutex<Option<ReceiverId>>> = Arc::new(Mutex::new(None));
        let own_id = Arc::clone(&slot);
        let id = self.connect(move |emission| {
            if tx.send(emission.clone()).is_err()
                && let Some(id) = own_id.lock().take()
                && let Some(inner) = weak.upgrade()
            {
                Signal { inner }.disconnect(id);
            }
        });
        *slot.lock() = Some(id);
        rx
    }

    /// Emit to every connected receiver; returns how many were invoked.
    pub fn send(&self, sender: &str, fields: Payload) -> usize {
        self.emit(Emission {
            signal: self.inner.name.clone(),
            sender: sender.to_string(),
            fields,
            relayed_by: None,
        })
    }

    pub(crate) fn emit(&self, emission: Emission) -> usize {
        let receivers: Vec<Receiver> = self
            .inner
            .receivers
            .lock()
            .iter()
            .map(|(_, r)| Arc::clone(r))
            .collect();
        for receiver in &receivers {
            receiver(&emission);
        }
        receivers.len()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("receivers", &self.receiver_count())
            .finish()
    }
}

struct Binding {
    owner: String,
    hook: CreationHook,
}

#[derive(Default)]
struct NamespaceInner {
    signals: BTreeMap<String, Signal>,
    binding: Option<Binding>,
}

/// Mapping of name to [`Signal`], created lazily.  Clone it cheaply; all
/// clones share the same signals.
#[derive(Clone, Default)]
pub struct Namespace {
    inner: Arc<Mutex<NamespaceInner>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the signal called `name`, creating it if required.
    ///
    /// Repeated calls return the same signal.
    pub fn signal(&self, name: &str) -> Signal {
        let (signal, hook) = {
            let mut inner = self.inner.lock();
            if let Some(signal) = inner.signals.get(name) {
                return signal.clone();
            }
            let signal = Signal::new(name);
            inner.signals.insert(name.to_string(), signal.clone());
            (signal, inner.binding.as_ref().map(|b| Arc::clone(&b.hook)))
        };
        if let Some(hook) = hook {
            hook(&signal);
        }
        signal
    }

    /// Look up `name` without creating it.
    pub fn get(&self, name: &str) -> Option<Signal> {
        self.inner.lock().signals.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().signals.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().signals.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().signals.is_empty()
    }

    /// `true` while a bridge is bound to this namespace.
    pub fn is_bound(&self) -> bool {
        self.inner.lock().binding.is_some()
    }

    /// Client identity of the bridge bound to this namespace, if any.
    pub fn bound_to(&self) -> Option<String> {
        self.inner.lock().binding.as_ref().map(|b| b.owner.clone())
    }

    /// Occupy the binding slot and snapshot the signals that exist right now.
    ///
    /// Signals created afterwards are passed to `hook` instead, so every
    /// signal is seen exactly once.
    pub(crate) fn install_hook(
        &self,
        owner: &str,
        hook: CreationHook,
    ) -> Result<Vec<Signal>, BridgeError> {
        let mut inner = self.inner.lock();
        if let Some(binding) = &inner.binding {
            return Err(BridgeError::AlreadyBound(binding.owner.clone()));
        }
        inner.binding = Some(Binding {
            owner: owner.to_string(),
            hook,
        });
        Ok(inner.signals.values().cloned().collect())
    }

    pub(crate) fn remove_hook(&self) -> Result<(), BridgeError> {
        self.inner
            .lock()
            .binding
            .take()
            .map(|_| ())
            .ok_or(BridgeError::NotBound)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Namespace")
            .field("signals", &inner.signals.keys().collect::<Vec<_>>())
            .field("bound_to", &inner.binding.as_ref().map(|b| &b.owner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fields(key: &str, value: serde_json::Value) -> Payload {
        let mut p = Payload::new();
        p.insert(key.to_string(), value);
        p
    }

    #[test]
    fn signal_lookup_is_lazy_and_stable() {
        let ns = Namespace::new();
        assert!(ns.get("foo").is_none());
        let a = ns.signal("foo");
        let b = ns.signal("foo");
        a.connect(|_| {});
        assert_eq!(b.receiver_count(), 1);
        assert_eq!(ns.names(), vec!["foo".to_string()]);
    }

    #[test]
    fn send_invokes_receivers_in_order() {
        let ns = Namespace::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let signal = ns.signal("foo");
        for tag in ["first", "second"] {
            let log = Arc::clone(&log);
            signal.connect(move |e: &Emission| {
                log.lock().push((tag, e.sender.clone(), e.fields.clone()));
            });
        }

        let n = signal.send("DropBot", fields("blah", json!("hello")));
        assert_eq!(n, 2);
        let log = log.lock();
        assert_eq!(log[0].0, "first");
        assert_eq!(log[1].0, "second");
        assert_eq!(log[0].1, "DropBot");
        assert_eq!(log[0].2["blah"], json!("hello"));
    }

    #[test]
    fn disconnect_stops_delivery() {
        let signal = Namespace::new().signal("foo");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = signal.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        signal.send("me", Payload::new());
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.send("me", Payload::new());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn receivers_may_reenter_the_signal() {
        let signal = Namespace::new().signal("foo");
        let inner = signal.clone();
        signal.connect(move |e: &Emission| {
            if e.sender == "outer" {
                inner.connect(|_| {});
            }
        });
        signal.send("outer", Payload::new());
        assert_eq!(signal.receiver_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_yields_emissions() {
        let signal = Namespace::new().signal("connected");
        let mut rx = signal.subscribe();
        signal.send("monitor", fields("device_id", json!("1234")));
        let emission = rx.recv().await.expect("emission");
        assert_eq!(emission.signal, "connected");
        assert_eq!(emission.fields["device_id"], json!("1234"));
    }

    #[test]
    fn dropped_subscription_disconnects_itself() {
        let signal = Namespace::new().signal("foo");
        let rx = signal.subscribe();
        assert_eq!(signal.receiver_count(), 1);
        drop(rx);
        signal.send("me", Payload::new());
        assert_eq!(signal.receiver_count(), 0);
    }

    #[test]
    fn hook_sees_existing_and_new_signals_once() {
        let ns = Namespace::new();
        ns.signal("existing");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let existing = ns
            .install_hook("client", Arc::new(move |s: &Signal| sink.lock().push(s.name().to_string())))
            .unwrap();
        assert_eq!(existing.len(), 1);
        ns.signal("fresh");
        ns.signal("fresh");
        assert_eq!(*seen.lock(), vec!["fresh".to_string()]);
        assert!(ns.is_bound());
        assert_eq!(ns.bound_to().as_deref(), Some("client"));
    }

    #[test]
    fn binding_slot_is_exclusive() {
        let ns = Namespace::new();
        ns.install_hook("a", Arc::new(|_: &Signal| {})).unwrap();
        let err = ns.install_hook("b", Arc::new(|_: &Signal| {})).unwrap_err();
        assert_eq!(err, BridgeError::AlreadyBound("a".to_string()));
        ns.remove_hook().unwrap();
        assert_eq!(ns.remove_hook().unwrap_err(), BridgeError::NotBound);
        assert!(!ns.is_bound());
    }
}

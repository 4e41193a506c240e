//! Request/response over pub/sub.
//!
//! The caller side ([`Correlator`]) subscribes to `{prefix}/result/{name}`,
//! publishes `{"args": [...], "kwargs": {...}}` to `{prefix}/{verb}/{name}`
//! and waits for the first message on the result topic.  Results carry no
//! request id, so requests for the same name are queued: at most one is in
//! flight per name and per correlator.
//!
//! The device side ([`RpcDispatcher`]) answers those requests from an
//! [`RpcTarget`].  A failing target publishes nothing; the caller then waits
//! until its timeout, or forever if none is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use sigbridge_types::{BridgeError, Message, Payload, RpcRequest, Verb};
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::topic::{self, DevicePrefix, ParsedTopic, TopicKind};
use crate::transport::{RouteId, Transport};

type ResultSlot = Arc<Mutex<Option<oneshot::Sender<Result<Option<Value>, BridgeError>>>>>;

fn decode_result(message: &Message) -> Result<Option<Value>, BridgeError> {
    if message.payload.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<Value>(&message.payload)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

/// Owns the temporary result route of one request.
struct PendingRequest<'a> {
    correlator: &'a Correlator,
    route: RouteId,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.correlator.transport.remove_route(self.route);
        self.correlator.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type Queue = Arc<tokio::sync::Mutex<()>>;

/// One request's place in its per-name queue.  The queue entry is forgotten
/// once no request holds or waits on it.
struct QueueTurn<'a> {
    correlator: &'a Correlator,
    name: &'a str,
    queue: Option<Queue>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for QueueTurn<'_> {
    fn drop(&mut self) {
        let mut queues = self.correlator.queues.lock();
        self.guard.take();
        self.queue.take();
        if queues.get(self.name).is_some_and(|q| Arc::strong_count(q) == 1) {
            queues.remove(self.name);
        }
    }
}

/// Caller-side RPC bound to one device prefix.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    prefix: DevicePrefix,
    timeout: Option<Duration>,
    queues: Mutex<HashMap<String, Queue>>,
    in_flight: AtomicUsize,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, prefix: DevicePrefix) -> Self {
        Self {
            transport,
            prefix,
            timeout: None,
            queues: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail requests with [`BridgeError::RemoteCallFailed`] after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn prefix(&self) -> &DevicePrefix {
        &self.prefix
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Requests currently holding a result route.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn enqueue<'a>(&'a self, name: &'a str) -> (QueueTurn<'a>, Queue) {
        let queue = Arc::clone(self.queues.lock().entry(name.to_string()).or_default());
        let turn = QueueTurn {
            correlator: self,
            name,
            queue: Some(Arc::clone(&queue)),
            guard: None,
        };
        (turn, queue)
    }

    /// Publish one request and wait for its result.
    ///
    /// Returns `None` when the result payload is empty or `null`.  Dropping
    /// the returned future removes the result route.
    pub async fn request(
        &self,
        verb: Verb,
        name: &str,
        args: Vec<Value>,
        kwargs: Payload,
    ) -> Result<Option<Value>, BridgeError> {
        let (mut turn, queue) = self.enqueue(name);
        turn.guard = Some(queue.lock_owned().await);

        let body = RpcRequest::new(args, kwargs).encode()?;
        let (tx, rx) = oneshot::channel();
        let slot: ResultSlot = Arc::new(Mutex::new(Some(tx)));
        let sink = Arc::clone(&slot);
        let route = self.transport.add_route(
            &self.prefix.result(name),
            Arc::new(move |message: &Message| {
                if let Some(tx) = sink.lock().take() {
                    let _ = tx.send(decode_result(message));
                }
            }),
        )?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingRequest {
            correlator: self,
            route,
        };

        let topic = self.prefix.request(verb, name);
        debug!(topic = %topic, "rpc request");
        self.transport.publish(Message::new(topic, body))?;

        let received = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                warn!(verb = %verb, name = %name, "rpc request timed out");
                BridgeError::RemoteCallFailed {
                    name: name.to_string(),
                    details: format!("no result within {} ms", limit.as_millis()),
                }
            })?,
            None => rx.await,
        };
        received.map_err(|_| BridgeError::RemoteCallFailed {
            name: name.to_string(),
            details: "result route closed".to_string(),
        })?
    }

    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Payload,
    ) -> Result<Option<Value>, BridgeError> {
        self.request(Verb::Call, name, args, kwargs).await
    }

    /// Read a property.
    pub async fn property(&self, name: &str) -> Result<Option<Value>, BridgeError> {
        self.request(Verb::Property, name, Vec::new(), Payload::new())
            .await
    }

    /// Write a property.  Resolves once the device acknowledges.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<(), BridgeError> {
        self.request(Verb::Property, name, vec![value], Payload::new())
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("prefix", &self.prefix.to_string())
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// The object answering remote requests on the device side.
pub trait RpcTarget: Send + Sync {
    fn get_property(&self, name: &str) -> Result<Value, BridgeError>;

    fn set_property(&self, name: &str, value: Value) -> Result<(), BridgeError>;

    fn invoke(&self, name: &str, args: &[Value], kwargs: &Payload) -> Result<Value, BridgeError>;
}

fn execute(target: &dyn RpcTarget, kind: TopicKind, name: &str, request: RpcRequest) -> Result<Vec<u8>, BridgeError> {
    match kind {
        TopicKind::Call => {
            let value = target.invoke(name, &request.args, &request.kwargs)?;
            Ok(serde_json::to_vec(&value)?)
        }
        TopicKind::Property => match request.args.into_iter().next() {
            None => Ok(serde_json::to_vec(&target.get_property(name)?)?),
            Some(value) => {
                target.set_property(name, value)?;
                Ok(Vec::new())
            }
        },
        TopicKind::Signal | TopicKind::Result => Err(BridgeError::MalformedTopic(format!(
            "`{}` is not a request kind",
            kind.as_str()
        ))),
    }
}

fn answer(transport: &dyn Transport, prefix: &DevicePrefix, target: &dyn RpcTarget, message: &Message) {
    let (kind, name) = match topic::parse(&message.topic) {
        Ok(ParsedTopic::Member {
            device,
            uuid,
            kind,
            name,
        }) if device == prefix.device() && uuid == prefix.uuid() => (kind, name),
        _ => {
            trace!(topic = %message.topic, "not a request for this device");
            return;
        }
    };
    let request = match RpcRequest::decode(&message.payload) {
        Ok(request) => request,
        Err(e) => {
            error!(topic = %message.topic, error = %e, "undecodable rpc request");
            return;
        }
    };
    match execute(target, kind, &name, request) {
        Ok(body) => {
            if let Err(e) = transport.publish(Message::new(prefix.result(&name), body)) {
                error!(name = %name, error = %e, "error publishing rpc result");
            }
        }
        Err(e) => error!(kind = kind.as_str(), name = %name, error = %e, "rpc request failed"),
    }
}

/// Routes of an attached [`RpcDispatcher`].  Dropping it detaches.
pub struct DispatcherHandle {
    transport: Arc<dyn Transport>,
    routes: Mutex<Vec<RouteId>>,
}

impl DispatcherHandle {
    /// Returns `false` if already detached.
    pub fn detach(&self) -> bool {
        let routes = std::mem::take(&mut *self.routes.lock());
        for route in &routes {
            self.transport.remove_route(*route);
        }
        !routes.is_empty()
    }

    pub fn is_attached(&self) -> bool {
        !self.routes.lock().is_empty()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

pub struct RpcDispatcher;

impl RpcDispatcher {
    /// Answer `call` and `property` requests under `prefix` from `target`.
    pub fn attach(
        transport: Arc<dyn Transport>,
        prefix: DevicePrefix,
        target: Arc<dyn RpcTarget>,
    ) -> Result<DispatcherHandle, BridgeError> {
        let handle = DispatcherHandle {
            transport: Arc::clone(&transport),
            routes: Mutex::new(Vec::new()),
        };
        for verb in [Verb::Call, Verb::Property] {
            let (t, p, d) = (Arc::clone(&transport), prefix.clone(), Arc::clone(&target));
            let route = transport.add_route(
                &prefix.request_filter(verb),
                Arc::new(move |message: &Message| answer(t.as_ref(), &p, d.as_ref(), message)),
            )?;
            handle.routes.lock().push(route);
        }
        debug!(prefix = %prefix, "rpc dispatcher attached");
        Ok(handle)
    }
}

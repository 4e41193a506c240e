//! `sigbridge-middleware` – signal and RPC plumbing over pub/sub.
//!
//! Carries local signal emissions and remote procedure calls across an MQTT
//! broker without caring what the payloads mean.
//!
//! # Modules
//!
//! - [`topic`] – builds and parses the topic strings of every message kind.
//! - [`bus`] – lazily created, named local signals with synchronous receivers.
//! - [`transport`] – the [`Transport`] seam, the `rumqttc` client and an
//!   in-process broker for tests.
//! - [`bridge`] – binds a [`Namespace`] to a transport in both directions.
//! - [`rpc`] – caller-side [`Correlator`] and device-side [`RpcDispatcher`].

pub mod bridge;
pub mod bus;
pub mod rpc;
pub mod topic;
pub mod transport;

pub use bridge::{BridgeHandle, SignalBridge};
pub use bus::{Emission, Namespace, ReceiverId, Signal};
pub use rpc::{Correlator, DispatcherHandle, RpcDispatcher, RpcTarget};
pub use topic::{DevicePrefix, ParsedTopic, TopicKind};
pub use transport::{
    MemoryBroker, MemoryClient, MessageHandler, MqttSettings, MqttTransport, RouteId, Transport,
};

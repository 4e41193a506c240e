//! The device collaborator consumed by the connection monitor.
//!
//! A [`DeviceSource`] reports attach/detach events; each attached [`Device`]
//! answers remote property and method requests through
//! [`RpcTarget`], describes itself for the presence announcement, and
//! queues its own events for the monitor to emit as local signals.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sigbridge_middleware::RpcTarget;
use sigbridge_types::{BridgeError, Payload};

/// Declared members of a remote device: the names a proxy may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceShape {
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub methods: BTreeSet<String>,
}

impl DeviceShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into());
        self
    }

    pub fn with_properties<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.methods.insert(name.into());
        self
    }

    pub fn with_methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains(name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }
}

/// A device-originated event, emitted locally as signal `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSignal {
    pub name: String,
    pub fields: Payload,
}

impl DeviceSignal {
    pub fn new(name: impl Into<String>, fields: Payload) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// A live device.
pub trait Device: RpcTarget {
    /// Instance identifier; becomes the `{uuid}` topic segment.
    fn uuid(&self) -> String;

    /// Body of the retained presence announcement.
    fn describe(&self) -> Result<Value, BridgeError>;

    fn shape(&self) -> DeviceShape;

    /// Enable the device's event notifications.
    fn arm_events(&self) -> Result<(), BridgeError>;

    /// Put the device in a safe idle state: outputs off, periodic updates off.
    fn quiesce(&self) -> Result<(), BridgeError>;

    /// Drain events raised since the last call.
    fn take_events(&self) -> Vec<DeviceSignal> {
        Vec::new()
    }
}

pub enum DeviceEvent {
    Attached(Arc<dyn Device>),
    Detached,
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Attached(device) => f.debug_tuple("Attached").field(&device.uuid()).finish(),
            DeviceEvent::Detached => f.write_str("Detached"),
        }
    }
}

/// Reports devices coming and going.
#[async_trait]
pub trait DeviceSource: Send {
    /// Wait for the next event.  `Ok(None)` means the source is exhausted.
    ///
    /// Must be cancel-safe: the monitor drops a pending poll on shutdown.
    async fn poll(&mut self) -> Result<Option<DeviceEvent>, BridgeError>;
}

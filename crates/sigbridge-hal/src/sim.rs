//! In-process simulated instrument for tests and hardware-free runs.
//!
//! [`SimDevice`] models a DropBot-like digital microfluidics controller: a
//! high-voltage output, a bank of electrode channels and a capacitance
//! sensor.  [`SimSource`] feeds attach/detach events to a monitor from a
//! channel, so tests can plug and unplug devices at will.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sigbridge_hal::sim::{SimDevice, SimSource};
//!
//! let device = Arc::new(SimDevice::with_uuid("1234"));
//! let (plug, source) = SimSource::attached(device);
//! // hand `source` to a monitor; later:
//! plug.detach();
//! # drop(source);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sigbridge_middleware::RpcTarget;
use sigbridge_types::{BridgeError, Payload};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::device::{Device, DeviceEvent, DeviceShape, DeviceSignal, DeviceSource};

pub const EVENT_CHANNELS_UPDATED: u64 = 1 << 1;
pub const EVENT_SHORTS_DETECTED: u64 = 1 << 2;
pub const EVENT_ENABLE: u64 = 1 << 15;

pub const DEFAULT_CHANNEL_COUNT: usize = 120;

/// Capacitance of one actuated electrode, in farads.
const ELECTRODE_CAPACITANCE: f64 = 2.5e-12;
/// Stray capacitance with nothing actuated, in farads.
const BASELINE_CAPACITANCE: f64 = 1.0e-12;

const PROPERTIES: [&str; 7] = [
    "voltage",
    "frequency",
    "hv_output_enabled",
    "capacitance_update_interval_ms",
    "event_mask",
    "state_of_channels",
    "channel_count",
];
const METHODS: [&str; 3] = ["update_state", "set_state_of_channels", "measure_capacitance"];

// ────────────────────────────────────────────────────────────────────────────
// Simulated device
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimState {
    voltage: f64,
    frequency: f64,
    hv_output_enabled: bool,
    capacitance_update_interval_ms: u64,
    event_mask: u64,
    channels: Vec<bool>,
}

impl SimState {
    fn active_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(i, on)| on.then_some(i))
            .collect()
    }
}

/// A simulated instrument.  Always succeeds unless asked for something it
/// does not have.
pub struct SimDevice {
    uuid: String,
    state: Mutex<SimState>,
    events: Mutex<Vec<DeviceSignal>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A device with a random v4 UUID.
    pub fn new() -> Self {
        Self::with_uuid(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            state: Mutex::new(SimState {
                voltage: 100.0,
                frequency: 10_000.0,
                hv_output_enabled: false,
                capacitance_update_interval_ms: 0,
                event_mask: 0,
                channels: vec![false; DEFAULT_CHANNEL_COUNT],
            }),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Shape of every simulated device.
    pub fn device_shape() -> DeviceShape {
        DeviceShape::new()
            .with_properties(PROPERTIES)
            .with_methods(METHODS)
    }

    pub fn active_channels(&self) -> Vec<usize> {
        self.state.lock().active_channels()
    }

    fn fault(&self, details: impl Into<String>) -> BridgeError {
        BridgeError::Device {
            device: self.uuid.clone(),
            details: details.into(),
        }
    }

    fn read(&self, state: &SimState, name: &str) -> Result<Value, BridgeError> {
        Ok(match name {
            "voltage" => json!(state.voltage),
            "frequency" => json!(state.frequency),
            "hv_output_enabled" => json!(state.hv_output_enabled),
            "capacitance_update_interval_ms" => json!(state.capacitance_update_interval_ms),
            "event_mask" => json!(state.event_mask),
            "state_of_channels" => json!(state.channels),
            "channel_count" => json!(state.channels.len()),
            other => return Err(BridgeError::UnknownMember(other.to_string())),
        })
    }

    /// Apply one property write to `state`.  Events it causes go to `events`
    /// and are queued by the caller once the write is committed.
    fn write(
        &self,
        state: &mut SimState,
        name: &str,
        value: Value,
        events: &mut Vec<DeviceSignal>,
    ) -> Result<(), BridgeError> {
        let number = |v: &Value| v.as_f64().ok_or_else(|| self.fault(format!("`{name}` expects a number, got {v}")));
        let integer = |v: &Value| v.as_u64().ok_or_else(|| self.fault(format!("`{name}` expects an integer, got {v}")));
        match name {
            "voltage" => {
                let volts = number(&value)?;
                if !(0.0..=200.0).contains(&volts) {
                    return Err(self.fault(format!("voltage {volts} V out of range")));
                }
                state.voltage = volts;
            }
            "frequency" => state.frequency = number(&value)?,
            "hv_output_enabled" => {
                state.hv_output_enabled = value
                    .as_bool()
                    .ok_or_else(|| self.fault(format!("`{name}` expects a bool, got {value}")))?;
            }
            "capacitance_update_interval_ms" => state.capacitance_update_interval_ms = integer(&value)?,
            "event_mask" => state.event_mask = integer(&value)?,
            "state_of_channels" => {
                let channels: Vec<bool> = serde_json::from_value(value)?;
                if channels.len() != state.channels.len() {
                    return Err(self.fault(format!(
                        "expected {} channel states, got {}",
                        state.channels.len(),
                        channels.len()
                    )));
                }
                replace_channels(state, channels, events);
            }
            "channel_count" => return Err(self.fault("`channel_count` is read-only")),
            other => return Err(BridgeError::UnknownMember(other.to_string())),
        }
        Ok(())
    }

    fn queue(&self, events: Vec<DeviceSignal>) {
        if !events.is_empty() {
            self.events.lock().extend(events);
        }
    }

    /// `set_state_of_channels(channels, append=false)`: actuate the listed
    /// channel indices, clearing all others unless `append` is set.
    fn set_state_of_channels(&self, args: &[Value], kwargs: &Payload) -> Result<Value, BridgeError> {
        let indices: Vec<usize> = match args.first().or_else(|| kwargs.get("channels")) {
            Some(v) => serde_json::from_value(v.clone())?,
            None => Vec::new(),
        };
        let append = kwargs.get("append").and_then(Value::as_bool).unwrap_or(false);

        let mut state = self.state.lock();
        let mut channels = if append {
            state.channels.clone()
        } else {
            vec![false; state.channels.len()]
        };
        for index in indices {
            let slot = channels
                .get_mut(index)
                .ok_or_else(|| self.fault(format!("channel {index} does not exist")))?;
            *slot = true;
        }
        let mut events = Vec::new();
        replace_channels(&mut state, channels, &mut events);
        self.queue(events);
        Ok(json!(true))
    }
}

fn replace_channels(state: &mut SimState, channels: Vec<bool>, events: &mut Vec<DeviceSignal>) {
    if state.channels == channels {
        return;
    }
    state.channels = channels;
    if state.event_mask & EVENT_CHANNELS_UPDATED != 0 {
        let mut fields = Payload::new();
        fields.insert("active".to_string(), json!(state.active_channels()));
        events.push(DeviceSignal::new("channels-updated", fields));
    }
}

impl RpcTarget for SimDevice {
    fn get_property(&self, name: &str) -> Result<Value, BridgeError> {
        let state = self.state.lock();
        self.read(&state, name)
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        self.write(&mut state, name, value, &mut events)?;
        self.queue(events);
        Ok(())
    }

    fn invoke(&self, name: &str, args: &[Value], kwargs: &Payload) -> Result<Value, BridgeError> {
        match name {
            "update_state" => {
                // Validate on a copy so a bad field leaves the device untouched.
                let mut state = self.state.lock();
                let mut next = state.clone();
                let mut events = Vec::new();
                for (key, value) in kwargs {
                    self.write(&mut next, key, value.clone(), &mut events)?;
                }
                *state = next;
                self.queue(events);
                Ok(json!(true))
            }
            "set_state_of_channels" => self.set_state_of_channels(args, kwargs),
            "measure_capacitance" => {
                let active = self.state.lock().active_channels().len() as f64;
                Ok(json!(BASELINE_CAPACITANCE + active * ELECTRODE_CAPACITANCE))
            }
            other => Err(BridgeError::UnknownMember(other.to_string())),
        }
    }
}

impl Device for SimDevice {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn describe(&self) -> Result<Value, BridgeError> {
        let state = self.state.lock();
        let mut properties = serde_json::Map::new();
        properties.insert("uuid".to_string(), json!(self.uuid));
        for name in PROPERTIES {
            properties.insert(name.to_string(), self.read(&state, name)?);
        }
        Ok(Value::Object(properties))
    }

    fn shape(&self) -> DeviceShape {
        Self::device_shape()
    }

    fn arm_events(&self) -> Result<(), BridgeError> {
        self.state.lock().event_mask = EVENT_CHANNELS_UPDATED | EVENT_SHORTS_DETECTED | EVENT_ENABLE;
        debug!(device = %self.uuid, "events armed");
        Ok(())
    }

    fn quiesce(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        let cleared = vec![false; state.channels.len()];
        let mut events = Vec::new();
        replace_channels(&mut state, cleared, &mut events);
        state.capacitance_update_interval_ms = 0;
        state.hv_output_enabled = false;
        self.queue(events);
        info!(device = %self.uuid, "device quiesced");
        Ok(())
    }

    fn take_events(&self) -> Vec<DeviceSignal> {
        std::mem::take(&mut *self.events.lock())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Channel-fed source
// ────────────────────────────────────────────────────────────────────────────

/// Sending half of a [`SimSource`]: plugs and unplugs devices.
#[derive(Clone)]
pub struct SimPlug {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl SimPlug {
    /// Returns `false` if the source has been dropped.
    pub fn attach(&self, device: Arc<dyn Device>) -> bool {
        self.tx.send(DeviceEvent::Attached(device)).is_ok()
    }

    pub fn detach(&self) -> bool {
        self.tx.send(DeviceEvent::Detached).is_ok()
    }
}

/// A [`DeviceSource`] fed through a [`SimPlug`].  Exhausted once every plug
/// is dropped and queued events are drained.
pub struct SimSource {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl SimSource {
    pub fn channel() -> (SimPlug, SimSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SimPlug { tx }, SimSource { rx })
    }

    /// A source whose first poll reports `device` as attached.
    pub fn attached(device: Arc<dyn Device>) -> (SimPlug, SimSource) {
        let (plug, source) = Self::channel();
        plug.attach(device);
        (plug, source)
    }
}

#[async_trait]
impl DeviceSource for SimSource {
    async fn poll(&mut self) -> Result<Option<DeviceEvent>, BridgeError> {
        Ok(self.rx.recv().await)
    }
}

//! `sigbridge-hal` – the device side of the bridge.
//!
//! Defines what the connection monitor needs from an instrument ([`Device`])
//! and from whatever discovers instruments ([`DeviceSource`]), plus an
//! in-process simulated instrument so the stack runs without hardware.
//!
//! # Modules
//!
//! - [`device`] – [`Device`], [`DeviceShape`], [`DeviceEvent`] and
//!   [`DeviceSource`].
//! - [`sim`] – [`SimDevice`](sim::SimDevice) and its channel-fed
//!   [`SimSource`](sim::SimSource).

pub mod device;
pub mod sim;

pub use device::{Device, DeviceEvent, DeviceShape, DeviceSignal, DeviceSource};
pub use sim::{SimDevice, SimPlug, SimSource};

//! `sigbridge-runtime` – long-running pieces built on the middleware.
//!
//! # Modules
//!
//! - [`monitor`] – [`Monitor`][monitor::Monitor]: a cancellable Tokio task
//!   that puts an attached device on the broker (RPC dispatcher, signal
//!   bridge, retained presence) and takes it off again when it detaches.
//! - [`proxy`] – [`DeviceProxy`][proxy::DeviceProxy] and
//!   [`BlockingDeviceProxy`][proxy::BlockingDeviceProxy]: call a remote
//!   device's properties and methods by name, checked against its
//!   [`DeviceShape`][sigbridge_hal::DeviceShape].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter.

pub mod monitor;
pub mod proxy;
pub mod telemetry;

pub use monitor::{Monitor, MonitorConfig, MonitorPhase};
pub use proxy::{BlockingDeviceProxy, DeviceProxy, ProxyClient, ProxyOptions};
pub use telemetry::{TracerProviderGuard, init_tracing};

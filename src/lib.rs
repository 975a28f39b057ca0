//! Follow a single BLE peripheral and stream its notified readings.
//!
//! The peripheral is known in advance by address. The monitor scans until the
//! peripheral advertises, connects, locates the target GATT characteristics,
//! enables notifications and publishes every received value to a sink owned by
//! the caller. Each notification is decoded as its first byte, so values range
//! from 0 to 255.
//!
//! The sequencing lives in [`Machine`], a state machine without any I/O:
//! transport events go in, [`Effect`]s come out. [`Monitor`] drives it with
//! `btleplug`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blegauge::{
//!     Error, Monitor, MonitorConfig, RadioCapability, SharedCapability, TargetDescriptor,
//!     UpdateBroadcast,
//! };
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     // The host grants radio access after its own permission flow
//!     let capability = SharedCapability::new(RadioCapability::Available);
//!     let updates = UpdateBroadcast::default();
//!
//!     let target = TargetDescriptor::parse("70:04:1D:38:75:76")?;
//!     let mut monitor = Monitor::new(target, capability, updates.clone());
//!     monitor.start(MonitorConfig::default()).await?;
//!
//!     let mut stream = updates.stream();
//!     monitor.start_scan().await?;
//!
//!     while let Some(update) = stream.next().await {
//!         println!("{}", update);
//!     }
//!
//!     monitor.close().await
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use btleplug::api::BDAddr;

pub use connection::{Connection, ConnectionState, DiscoveredService, LinkId};
pub use error::{Error, Failure, Result};
pub use gate::{AdapterGate, RadioCapability, SharedCapability};
pub use machine::{Effect, Event, Machine, Rejected};
pub use monitor::{Monitor, MonitorConfig};
pub use notification::{decode, NotificationChannel, Sample};
pub use scanner::{ScanId, Scanner};
pub use sink::{ResultSink, Status, Update, UpdateBroadcast};
pub use target::TargetDescriptor;

mod connection;
mod error;
mod gate;
mod link;
mod machine;
mod monitor;
mod notification;
mod scanner;
mod sink;
mod target;

pub mod common;

//! Host-side engine for the Jacdac device bus.
//!
//! jacbus decodes frames arriving from one or more transports, keeps a live graph of
//! the devices, services, registers and events it has seen, and lets clients talk back
//! through commands, acknowledged sends, register refreshes and inbound pipes. Recorded
//! traffic can be replayed through the same dispatch path as live traffic.
//!
//! # Features
//!
//! - **Framing**: CRC-checked multi-packet frames with malformed-frame accounting
//! - **Transports**: loopback, socket, worker channel and (feature `serial`) serial ports
//! - **Device graph**: announce tracking, restarts, lost and disconnected devices
//! - **Roles**: role manager client with debounced refresh and simulator start-up
//! - **Replay**: text traces, a live recorder and a speed-scaled frame player
//!
//! # Architecture
//!
//! ```text
//!  Transport ──frames──► Bus::process_frame ──► BusState (device graph)
//!      ▲                        │                      │
//!      │                        ▼                      ▼
//!  Bus::send_packet      broadcast<BusEvent> ──► RoleManagerClient, InPipeReader,
//!                                                TraceRecorder, SimulatedDevice
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use jacbus::{Bus, BusEvent, BusOptions, LoopbackTransport, Transport};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> jacbus::Result<()> {
//!     let bus = Bus::new(BusOptions::default())?;
//!     let (io, _link) = LoopbackTransport::new();
//!     bus.add_transport(Transport::new(io));
//!     bus.connect().await?;
//!
//!     let mut events = bus.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let BusEvent::DeviceConnect(id) = event {
//!             println!("device {id} connected");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod util;

pub mod catalog;
pub mod constants;
pub mod packet;
pub mod scheduler;

pub mod bus;
pub mod node;
pub mod transport;

pub mod pipe;
pub mod player;
pub mod role_manager;
pub mod sim;
pub mod stream;
pub mod trace;

pub use error::{BusError, Result};

pub use bus::{Bus, BusEvent, BusOptions, BusState, BusStats, DeviceNames, MemoryDeviceNames, WeakBus};
pub use catalog::SpecificationCatalog;
pub use node::{
    DeviceHandle, EventHandle, RegisterHandle, ServiceFilter, ServiceHandle, ServicePath,
};
pub use packet::{DeviceId, Packet, decode_frames};
pub use pipe::InPipeReader;
pub use player::{FramePlayer, PlayerEvent};
pub use role_manager::{Role, RoleManagerClient};
pub use sim::{ServiceProviderRegistry, SimulatedDevice, SimulatedService, SimulatorRegistry};
pub use stream::{Throttle, ThrottleExt, UpdateRate};
pub use trace::{Frame, Trace, TraceRecorder};
pub use transport::{ConnectionState, LoopbackHandle, LoopbackTransport, Transport, TransportKind};

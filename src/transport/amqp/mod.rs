//! Multiplexing AMQP transport
//!
//! Many devices share one TLS/SASL/AMQP connection and one session; each
//! device gets its own sender and, on request, its own receiver link.
//! Decision logic is kept apart from the code that drives collaborators.
//!
//! # Architecture
//!
//! - [`link_naming`] - Link names and per-device addresses (pure)
//! - [`event_queue`] - Waiting and in-progress message bookkeeping
//! - [`messaging`] - Conversion between upper-layer and AMQP messages (pure)
//! - [`retry`] - Tick planning and retry decisions (pure)
//! - [`collaborators`] - Traits for TLS, SASL, AMQP, authentication and methods
//! - [`connection`] - The shared connection stack
//! - [`device`] - Per-device authentication and link lifecycle
//! - [`client`] - Public API and per-tick orchestration
//!
//! # Usage
//!
//! ```rust
//! use iothub_amqp::testing::{MockDeviceClient, MockWorld};
//! use iothub_amqp::transport::amqp::AmqpTransport;
//! use iothub_amqp::{DeviceConfig, IotHubMessage, TransportConfig, WaitingList};
//!
//! let world = MockWorld::new();
//! let config = TransportConfig::new("myhub", "azure-devices.net");
//! let mut transport = AmqpTransport::create(&config, world.dependencies())?;
//!
//! let waiting = WaitingList::new();
//! transport.register(
//!     &DeviceConfig::with_key("thermostat-1", "c2VjcmV0"),
//!     Box::new(MockDeviceClient::new(&world)),
//!     waiting.clone(),
//! )?;
//! waiting.enqueue(IotHubMessage::text("{\"temperature\":21.5}"));
//!
//! for _ in 0..4 {
//!     transport.do_work();
//! }
//! assert!(waiting.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod collaborators;
pub mod connection;
pub mod device;
pub mod event_queue;
pub mod link_naming;
pub mod messaging;
pub mod retry;

// Re-export public types for convenience
pub use client::{AmqpTransport, RetryPolicy};
pub use collaborators::{
    AmqpEvent, AuthenticationStatus, CredentialType, DeviceClient, LinkState, OptionValue,
    TransportDependencies,
};
pub use connection::ConnectionManager;
pub use device::{DeviceHandle, DeviceStatus};
pub use messaging::{AmqpMessage, Disposition, MessageConverter, MessagingError};
pub use retry::{ConnectionState, RetryPlanner};

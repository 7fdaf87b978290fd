//! IoT Hub AMQP transport - Rust Implementation
//!
//! A multiplexing device-to-cloud transport: many logical devices share one
//! authenticated AMQP connection to an IoT hub, each with its own sender and
//! receiver links and its own credential lifecycle.
//!
//! # Overview
//!
//! This crate provides:
//! - The per-tick transport state machine with connection-wide retry
//! - Per-device authentication, link and method-subscription management
//! - Outbound queue bookkeeping that never loses or duplicates a message
//! - Collaborator traits for TLS, SASL, AMQP, authentication and methods
//! - In-memory fakes of every collaborator, plus a fleet simulator binary
//!
//! # Quick Start
//!
//! ```rust
//! use iothub_amqp::testing::{MockDeviceClient, MockWorld};
//! use iothub_amqp::{AmqpTransport, DeviceConfig, TransportConfig, WaitingList};
//!
//! let world = MockWorld::new();
//! let mut transport = AmqpTransport::create(
//!     &TransportConfig::new("servername", "domainname"),
//!     world.dependencies(),
//! )
//! .unwrap();
//! assert_eq!(transport.host_fqdn(), "servername.domainname");
//!
//! let handle = transport
//!     .register(
//!         &DeviceConfig::with_key("device-1", "key"),
//!         Box::new(MockDeviceClient::new(&world)),
//!         WaitingList::new(),
//!     )
//!     .unwrap();
//! transport.subscribe(handle).unwrap();
//! transport.do_work();
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{CollaboratorError, TransportError, TransportResult};
pub use protocol::*;
pub use transport::amqp::{
    AmqpTransport, ConnectionState, CredentialType, DeviceClient, DeviceHandle, DeviceStatus,
    OptionValue, TransportDependencies,
};

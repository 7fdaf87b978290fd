//! Transport layer for device-to-cloud communication
//!
//! The AMQP transport multiplexes any number of devices over one shared
//! connection to the hub.

pub mod amqp;

/// Type alias for the AMQP transport
pub type AmqpTransport = amqp::AmqpTransport;

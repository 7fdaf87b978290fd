//! Testing utilities and mock implementations
//!
//! In-memory fakes for every external collaborator, so the transport can be
//! exercised without a network, TLS stack or AMQP library. The fleet
//! simulator runs on them too.

pub mod mocks;

pub use mocks::*;

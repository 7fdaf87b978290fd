//! Types exchanged with the upper client layer
//!
//! Outbound records, the shared waiting list, and the result enums the
//! transport reports back through callbacks.

pub mod messages;

pub use messages::*;

//! Device message types and topic conventions
//!
//! Payload structures published by a device and the topic names they travel on.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;

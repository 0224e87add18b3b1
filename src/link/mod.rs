//! Connection lifecycle
//!
//! - [`state`] - Pure lifecycle states and transitions
//! - [`handle`] - The live connection handle and its subscription set
//! - [`manager`] - Event-driven lifecycle manager owning the current handle
//! - [`device`] - Per-device facade with the hello announcement

pub mod device;
pub mod handle;
pub mod manager;
pub mod state;

pub use device::{DeviceLink, HelloHook};
pub use handle::{ConnectionHandle, Subscription, SubscriptionSet};
pub use manager::{ConnectHook, LinkManager};
pub use state::ConnectionState;

//! Testing utilities and mock implementations
//!
//! Lets the publish path and the connection lifecycle run without a broker.

pub mod mocks;

pub use mocks::*;

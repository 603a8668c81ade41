//! WSE device gateway.
//!
//! Authenticated WebSocket clients issue commands to devices attached over
//! their own WebSocket links. Connections are spread over in-process workers
//! that share admission control, the command dispatcher and a message bus
//! (in-process or Redis) for cross-worker and cross-instance fan-out.

pub mod config;
pub mod error;
pub mod gateway;
pub mod jwt;

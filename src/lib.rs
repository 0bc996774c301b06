//! Gateway Server protocol frontends for a LoRaWAN network stack.
//!
//! Gateways connect over gRPC, MQTT (two dialects), the Basic Station WebSocket
//! protocol or the Industries WebSocket protocol. Every frontend authenticates the
//! gateway, binds it to a [`gateway::Connection`] and translates its traffic to and
//! from the shared [`model`].

pub mod cluster;
pub mod config;
pub mod devicerepository;
pub mod gateway;
pub mod io;
pub mod model;
pub mod server;
pub mod utils;

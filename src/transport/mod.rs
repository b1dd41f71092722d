//! The `transport` module is responsible for handling network communication
//! with clients over WebSockets.
//!
//! - `socket`: the socket contract and its `tokio-tungstenite` adapter
//! - `buffer`: bounded, flush-delimited byte buffers
//! - `pipe`: the per-connection duplex engine (fill, drain, outbound drain)
//! - `connection`: one client's lifecycle between the pipe and the broker
//! - `websocket`: the listener, upgrade routing and shutdown

pub mod buffer;
pub mod connection;
pub mod pipe;
pub mod socket;
pub mod websocket;

#[cfg(test)]
mod memory;

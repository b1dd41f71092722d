//! # tidemq
//!
//! `tidemq` is an in-memory publish/subscribe message broker spoken over
//! WebSockets. Clients exchange direction-tagged JSON envelopes, publish to
//! case-insensitive topics and acknowledge or reject every delivery they
//! receive.
//!
//! ## Core Modules
//!
//! - `protocol`: the message variants, envelopes and the JSON codec.
//! - `transport`: the socket contract, the buffered duplex pipe, the
//!   per-connection handler and the WebSocket listener.
//! - `broker`: client and topic registries, fan-out, acknowledgement and
//!   redelivery bookkeeping.
//! - `client`: the broker's view of a connected client.
//! - `config`: layered configuration loading.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod transport;
pub mod utils;

//! In-memory chat broadcaster.
//!
//! Clients join a single server process, open a long-lived stream, and every
//! message any of them sends is pushed to all open streams. Modules, leaf
//! first:
//!
//! - [`message`]: users, chat messages and the newline-delimited JSON wire
//!   protocol.
//! - [`directory`]: the live user list in join order.
//! - [`registry`]: one outbound channel per connected user.
//! - [`dispatcher`]: best-effort fan-out with bounded per-recipient delivery.
//! - [`hub`]: join / open stream / send / disconnect lifecycle.
//! - [`server`]: TCP accept loop mapping wire requests onto the hub.
//! - [`connection`], [`retry`]: client-side calls with reconnect and backoff.
//! - [`input`], [`client`]: the terminal client's listener and sender loops.
//! - [`cli`]: command-line interface for both roles.

pub mod cli;
pub mod client;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod hub;
pub mod input;
pub mod message;
pub mod registry;
pub mod retry;
pub mod server;

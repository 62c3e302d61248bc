//! # rsocks5
//!
//! This crate implements a reverse SOCKS5 proxy. A public-facing proxy accepts
//! SOCKS5 clients, but instead of dialling out itself it forwards every client
//! over one persistent, multiplexed tunnel to a remote agent (the "backdoor").
//! The agent runs the SOCKS5 handshake and opens the outbound connection from
//! its own network, so the egress point can live behind NAT or a firewall while
//! the proxy endpoint stays reachable from the internet.
//!
//! ## Overview
//!
//! ```text
//!  SOCKS5 client ──► [proxy]  Source ──┐                ┌── Target ──► destination
//!  SOCKS5 client ──► [proxy]  Source ──┤══ tunnel ═════ ├── Target ──► destination
//!                                      └ frames (id,len)┘   [agent]
//! ```
//!
//! - **Proxy mode**: binds the tunnel listener, waits for exactly one agent,
//!   then binds the public proxy listener. Every client connection becomes a
//!   *Source* stream with its own stream id.
//! - **Backdoor mode**: dials the tunnel address. Frames for an unknown stream
//!   id start a SOCKS5 handshake; once the CONNECT request is parsed the agent
//!   opens a *Target* connection and relays bytes both ways.
//!
//! ### Tunnel framing
//!
//! Every frame is `length (u16, BE) | stream id (u32, BE) | payload[length]`.
//! A frame with an empty payload closes the stream on the receiving side.
//! See [`tunnel::Frame`].
//!
//! ### Runtime model
//!
//! Everything runs on one thread inside an [`EventLoop`], a readiness
//! dispatcher built on `mio`. Sockets are non-blocking from creation, each
//! [`Connection`] buffers reads and writes, and per-role behavior is injected
//! as a [`connection::Handler`].
//!
//! ## Examples
//!
//! Running the agent side against an already listening proxy:
//!
//! ```no_run
//! use rsocks5::{method_handlers::TunnelConnect, tunnel::agent, EventLoop};
//!
//! fn main() -> rsocks5::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let tunnel_addr = "203.0.113.7:1081".parse().unwrap();
//!     agent::connect(&event_loop, tunnel_addr, 1080, TunnelConnect)?;
//!     event_loop.run()
//! }
//! ```
//!
//! ### Explanation of Non-Obvious Parts
//!
//! 1. **`TunnelConnect`**:
//!     - The [`method_handlers::Connect`] implementation that actually dials the
//!       destination requested by a client. [`method_handlers::ConnectDenier`]
//!       refuses every request instead.
//!
//! 2. **`event_loop.run()`**:
//!     - Blocks until the loop is stopped or runs out of work. Loss of the
//!       tunnel stops the loop with [`Error::TunnelLost`], so the caller can
//!       exit with a failure status.

use std::{io, net::SocketAddr};

use thiserror::Error;

pub mod config;
pub mod connection;
pub mod event_loop;
pub mod handshake;
pub mod listener;
pub mod method_handlers;
pub mod protocol;
pub mod tunnel;

pub use connection::Connection;
pub use event_loop::EventLoop;
pub use listener::Listener;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Tunnel {0} lost")]
    TunnelLost(String),
    #[error("Error in network operation")]
    IoError(#[from] io::Error),
}

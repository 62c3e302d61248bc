//! The egress side: streams arrive as raw SOCKS5 bytes and leave as Target
//! connections opened from the agent's network.

use std::{net::SocketAddr, rc::Rc};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{Frame, Role, StreamHandler, Tunnel};
use crate::{
    connection::{Connection, Handler},
    event_loop::EventLoop,
    handshake::{Handshake, Step},
    method_handlers::Connect,
    protocol::{Reply, SocksSocketAddr, VERSION},
    Result,
};

pub enum AgentPeer {
    /// SOCKS5 handshake still in progress.
    Unformed(Handshake),
    /// Outbound connection, possibly still connecting. Frames that arrive
    /// before the connect settles wait in its write queue.
    Target(Rc<Connection>),
}

/// The agent end. `C` opens the outbound connections.
pub struct Agent<C> {
    connector: C,
    bound: SocksSocketAddr,
}

impl<C: Connect + 'static> Agent<C> {
    /// `bind_port` is the port reported as BND.PORT in every CONNECT reply.
    pub fn new(connector: C, bind_port: u16) -> Self {
        Agent {
            connector,
            bound: SocksSocketAddr::unspecified(bind_port),
        }
    }
}

impl<C: Connect + 'static> Role for Agent<C> {
    type Peer = AgentPeer;
    const NAME: &'static str = "RemoteTunnel";

    fn dispatch(tunnel: &Tunnel<Self>, frame: Frame) {
        let stream_id = frame.stream_id();
        let target = match tunnel.streams.borrow().get(&stream_id) {
            Some(AgentPeer::Target(target)) => Some(target.clone()),
            _ => None,
        };
        if let Some(target) = target {
            if frame.is_close() {
                debug!(stream_id, "closed by proxy");
                target.close();
            } else {
                target.send(frame.payload());
            }
            return;
        }

        let pending = match tunnel.streams.borrow_mut().remove(&stream_id) {
            Some(AgentPeer::Unformed(handshake)) => Some(handshake),
            _ => None,
        };
        match pending {
            Some(_) if frame.is_close() => debug!(stream_id, "handshake abandoned"),
            None if frame.is_close() => debug!(stream_id, "close for unknown stream ignored"),
            Some(handshake) => tunnel.advance_handshake(stream_id, handshake, frame.payload()),
            None => {
                debug!(stream_id, "stream opened");
                tunnel.advance_handshake(stream_id, Handshake::new(), frame.payload())
            }
        }
    }
}

impl<C: Connect + 'static> Tunnel<Agent<C>> {
    fn advance_handshake(&self, stream_id: u32, mut handshake: Handshake, data: &[u8]) {
        handshake.feed(data);
        loop {
            match handshake.advance() {
                Ok(Step::Incomplete) => {
                    self.streams
                        .borrow_mut()
                        .insert(stream_id, AgentPeer::Unformed(handshake));
                    return;
                }
                Ok(Step::Greeted(method)) => {
                    debug!(stream_id, ?method, "greeting accepted");
                    self.send(stream_id, &[VERSION, method.to_u8()]);
                }
                Ok(Step::Connect(destination)) => {
                    self.open_target(stream_id, destination, handshake.into_remainder());
                    return;
                }
                Err(err) => {
                    warn!(stream_id, stage = %handshake.stage(), %err, "handshake rejected");
                    if let Some(reply) = err.reply() {
                        self.send(stream_id, &reply);
                    }
                    self.remove_stream(stream_id, true);
                    return;
                }
            }
        }
    }

    /// Starts the outbound connect. The CONNECT reply goes out once the
    /// loop reports how it went, see [`TargetHandler`].
    fn open_target(&self, stream_id: u32, destination: SocksSocketAddr, early_data: Bytes) {
        let name = format!("Target<{destination}>");
        let handler = Rc::new(TargetHandler {
            relay: StreamHandler {
                tunnel: self.this.clone(),
                stream_id,
            },
            destination: destination.clone(),
        });
        let target = self
            .role
            .connector
            .establish_connection(&destination)
            .and_then(|stream| Connection::connecting(&self.event_loop, stream, name, handler));

        match target {
            Ok(target) => {
                debug!(stream_id, %destination, "connecting");
                self.streams
                    .borrow_mut()
                    .insert(stream_id, AgentPeer::Target(target.clone()));
                target.send(&early_data);
            }
            Err(err) => {
                warn!(stream_id, %destination, %err, "connect failed");
                self.refuse(stream_id);
            }
        }
    }

    fn refuse(&self, stream_id: u32) {
        self.send(stream_id, &Reply::HostUnreachable.to_bytes(&self.role.bound));
        self.remove_stream(stream_id, true);
    }
}

/// A Target connection's handler. Answers the CONNECT request once the
/// outbound connect settles, then relays like any leaf.
struct TargetHandler<C: Connect + 'static> {
    relay: StreamHandler<Agent<C>>,
    destination: SocksSocketAddr,
}

impl<C: Connect + 'static> Handler for TargetHandler<C> {
    fn on_data(&self, conn: &Connection, chunk: &[u8], buffered: &[u8]) -> usize {
        self.relay.on_data(conn, chunk, buffered)
    }

    fn on_connect(&self, conn: &Connection) {
        let stream_id = self.relay.stream_id;
        // The proxy already dropped a stream it asked to close.
        if conn.is_closing() {
            return;
        }
        if let Some(tunnel) = self.relay.tunnel.upgrade() {
            info!(stream_id, destination = %self.destination, "connected");
            tunnel.send(stream_id, &Reply::Success.to_bytes(&tunnel.role.bound));
        }
    }

    fn on_destroy(&self, conn: &Connection) {
        // Never connected and not closed by the proxy: the client still
        // waits for its reply.
        if conn.is_connecting() && !conn.is_closing() {
            let stream_id = self.relay.stream_id;
            if let Some(tunnel) = self.relay.tunnel.upgrade() {
                warn!(stream_id, destination = %self.destination, "connect failed");
                tunnel.refuse(stream_id);
            }
            return;
        }
        self.relay.on_destroy(conn);
    }
}

/// Runs backdoor mode.
///
/// Starts dialing the proxy's tunnel listener and serves every stream it
/// opens. A dial that fails surfaces as a lost tunnel once the loop runs.
/// `bind_port` is the proxy port echoed in CONNECT replies.
pub fn connect<C: Connect + 'static>(
    event_loop: &EventLoop,
    tunnel_addr: SocketAddr,
    bind_port: u16,
    connector: C,
) -> Result<Rc<Tunnel<Agent<C>>>> {
    let tunnel = Tunnel::new(event_loop, Agent::new(connector, bind_port));
    tunnel.dial(tunnel_addr)?;
    Ok(tunnel)
}

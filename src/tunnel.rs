//! The multiplexed tunnel between the proxy and the agent.
//!
//! A [`Tunnel`] owns the physical tunnel [`Connection`] and a table of live
//! streams. What a stream entry is, and what an incoming frame does to it,
//! depends on the [`Role`]: [`proxy::Proxy`] keeps one Source connection per
//! SOCKS5 client, [`agent::Agent`] keeps either a pending handshake or a
//! Target connection.

use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use bytes::BytesMut;
use mio::net::TcpStream;
use tracing::{debug, error, info, trace};

use crate::{
    connection::{Connection, Handler},
    event_loop::EventLoop,
    Error,
};

pub mod agent;
mod frame;
pub mod proxy;

pub use frame::{Frame, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Behavior of one end of the tunnel.
pub trait Role: Sized + 'static {
    /// What the stream table holds per stream id.
    type Peer: 'static;

    /// Prefix of the tunnel connection's name in logs.
    const NAME: &'static str;

    /// Handles one decoded frame. Frames arrive in wire order.
    fn dispatch(tunnel: &Tunnel<Self>, frame: Frame);
}

pub struct Tunnel<R: Role> {
    this: Weak<Tunnel<R>>,
    event_loop: EventLoop,
    role: R,
    conn: RefCell<Option<Rc<Connection>>>,
    streams: RefCell<HashMap<u32, R::Peer>>,
}

impl<R: Role> Tunnel<R> {
    pub fn new(event_loop: &EventLoop, role: R) -> Rc<Self> {
        Rc::new_cyclic(|this| Tunnel {
            this: this.clone(),
            event_loop: event_loop.clone(),
            role,
            conn: RefCell::new(None),
            streams: RefCell::new(HashMap::new()),
        })
    }

    /// Makes `stream` the tunnel connection.
    pub fn attach(self: &Rc<Self>, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let conn = Connection::new(
            &self.event_loop,
            stream,
            format!("{}<{peer}>", R::NAME),
            self.clone(),
        )?;
        *self.conn.borrow_mut() = Some(conn);
        Ok(())
    }

    /// Starts connecting to `addr` and makes that the tunnel connection.
    /// A failed connect is reported like any other tunnel loss.
    pub fn dial(self: &Rc<Self>, addr: SocketAddr) -> io::Result<()> {
        let stream = TcpStream::connect(addr)?;
        let conn = Connection::connecting(
            &self.event_loop,
            stream,
            format!("{}<{addr}>", R::NAME),
            self.clone(),
        )?;
        *self.conn.borrow_mut() = Some(conn);
        Ok(())
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn is_attached(&self) -> bool {
        self.conn
            .borrow()
            .as_ref()
            .is_some_and(|conn| !conn.is_destroyed())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.borrow().len()
    }

    pub fn contains_stream(&self, stream_id: u32) -> bool {
        self.streams.borrow().contains_key(&stream_id)
    }

    /// Frames `data` for `stream_id` and queues it on the tunnel.
    ///
    /// Payloads above [`MAX_PAYLOAD_SIZE`] are split over several frames. An
    /// empty `data` queues a close frame. Does nothing once the tunnel is gone.
    pub fn send(&self, stream_id: u32, data: &[u8]) {
        let Some(conn) = self.conn.borrow().clone() else {
            return;
        };

        let mut buf = BytesMut::new();
        if data.is_empty() {
            Frame::close(stream_id).put(&mut buf);
        } else {
            for frame in Frame::split(stream_id, data) {
                frame.put(&mut buf);
            }
        }
        trace!(stream_id, bytes = data.len(), "frame queued");
        conn.send(&buf);
    }

    /// Forgets `stream_id`; with `notify` the other side is told to close it.
    pub fn remove_stream(&self, stream_id: u32, notify: bool) -> Option<R::Peer> {
        let removed = self.streams.borrow_mut().remove(&stream_id);
        debug!(stream_id, notify, "stream removed");
        if notify {
            self.send(stream_id, &[]);
        }
        removed
    }

    fn handler(&self, stream_id: u32) -> Rc<StreamHandler<R>> {
        Rc::new(StreamHandler {
            tunnel: self.this.clone(),
            stream_id,
        })
    }
}

impl<R: Role> Handler for Tunnel<R> {
    fn on_data(&self, _conn: &Connection, _chunk: &[u8], buffered: &[u8]) -> usize {
        let mut consumed = 0;
        while let Some((frame, used)) = Frame::decode(&buffered[consumed..]) {
            consumed += used;
            trace!(
                stream_id = frame.stream_id(),
                bytes = frame.payload().len(),
                "frame received"
            );
            R::dispatch(self, frame);
        }
        consumed
    }

    fn on_connect(&self, conn: &Connection) {
        info!(conn = %conn.name(), "tunnel established");
    }

    fn on_destroy(&self, conn: &Connection) {
        self.conn.borrow_mut().take();
        // Nothing can be forwarded any more, so a lost tunnel ends the loop.
        if self.event_loop.is_running() {
            error!(conn = %conn.name(), "tunnel lost");
            self.event_loop
                .fail(Error::TunnelLost(conn.name().to_owned()));
        }
    }
}

/// Relays a leaf connection (Source or Target) into the tunnel.
pub(crate) struct StreamHandler<R: Role> {
    tunnel: Weak<Tunnel<R>>,
    stream_id: u32,
}

impl<R: Role> Handler for StreamHandler<R> {
    fn on_data(&self, _conn: &Connection, _chunk: &[u8], buffered: &[u8]) -> usize {
        if let Some(tunnel) = self.tunnel.upgrade() {
            tunnel.send(self.stream_id, buffered);
        }
        buffered.len()
    }

    fn on_destroy(&self, conn: &Connection) {
        // A local close was asked for by the other side, which already
        // dropped the stream.
        if let Some(tunnel) = self.tunnel.upgrade() {
            tunnel.remove_stream(self.stream_id, !conn.is_closing());
        }
    }
}

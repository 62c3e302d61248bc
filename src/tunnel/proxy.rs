//! The public side: SOCKS5 clients come in here and ride the tunnel.

use std::{cell::Cell, io, net::SocketAddr, rc::Rc};

use mio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{Frame, Role, Tunnel};
use crate::{connection::Connection, event_loop::EventLoop, listener::Listener, Result};

/// The proxy end. Stream ids are handed out here.
pub struct Proxy {
    next_id: Cell<u32>,
}

impl Default for Proxy {
    fn default() -> Self {
        Proxy {
            next_id: Cell::new(1),
        }
    }
}

impl Role for Proxy {
    type Peer = Rc<Connection>;
    const NAME: &'static str = "LocalTunnel";

    fn dispatch(tunnel: &Tunnel<Self>, frame: Frame) {
        let stream_id = frame.stream_id();
        let source = tunnel.streams.borrow().get(&stream_id).cloned();
        let Some(source) = source else {
            debug!(stream_id, "frame for unknown stream dropped");
            return;
        };

        if frame.is_close() {
            debug!(stream_id, "closed by agent");
            source.close();
        } else {
            source.send(frame.payload());
        }
    }
}

impl Tunnel<Proxy> {
    /// Turns an accepted client into a Source stream and returns its id.
    pub fn add_source(&self, stream: TcpStream, addr: SocketAddr) -> io::Result<u32> {
        let stream_id = self.allocate_id();
        let source = Connection::new(
            &self.event_loop,
            stream,
            format!("Source<{addr}>"),
            self.handler(stream_id),
        )?;
        self.streams.borrow_mut().insert(stream_id, source);
        debug!(stream_id, %addr, "stream opened");
        Ok(stream_id)
    }

    /// Next id in sequence that is not held by a live stream.
    fn allocate_id(&self) -> u32 {
        let streams = self.streams.borrow();
        loop {
            let id = self.role.next_id.get();
            self.role.next_id.set(id.wrapping_add(1));
            if !streams.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Runs proxy mode.
///
/// Binds the tunnel listener and waits for the agent. The first connection
/// becomes the tunnel and the tunnel listener closes; only then is the
/// public SOCKS5 listener bound on `proxy_addr`. Returns the tunnel listener.
pub fn serve(
    event_loop: &EventLoop,
    tunnel_addr: SocketAddr,
    proxy_addr: SocketAddr,
) -> Result<Rc<Listener>> {
    let tunnel = Tunnel::new(event_loop, Proxy::default());
    let handle = event_loop.clone();

    Listener::bind(
        event_loop,
        "TunnelListener",
        tunnel_addr,
        move |listener, stream, addr| {
            listener.stop();
            info!(%addr, "agent attached");
            tunnel.attach(stream, addr)?;

            let tunnel = tunnel.clone();
            Listener::bind(
                &handle,
                "ProxyListener",
                proxy_addr,
                move |_, stream, addr| {
                    if let Err(err) = tunnel.add_source(stream, addr) {
                        warn!(%addr, %err, "failed to register source");
                    }
                    Ok(())
                },
            )?;
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{tunnel::FRAME_HEADER_SIZE, Error};

    fn socket() -> (TcpStream, SocketAddr, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), addr, client)
    }

    fn read_frame(stream: &mut StdTcpStream) -> Frame {
        let mut header = [0; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(FRAME_HEADER_SIZE + len, 0);
        stream.read_exact(&mut frame[FRAME_HEADER_SIZE..]).unwrap();
        Frame::decode(&frame).unwrap().0
    }

    fn free_addr() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn stream_ids_skip_live_streams() {
        let event_loop = EventLoop::new().unwrap();
        let tunnel = Tunnel::new(&event_loop, Proxy::default());
        tunnel.role.next_id.set(u32::MAX);

        let mut clients = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let (stream, addr, client) = socket();
            ids.push(tunnel.add_source(stream, addr).unwrap());
            clients.push(client);
        }
        tunnel.role.next_id.set(u32::MAX);
        let (stream, addr, _client) = socket();
        ids.push(tunnel.add_source(stream, addr).unwrap());

        assert_eq!(ids, vec![u32::MAX, 0, 1]);
        assert_eq!(tunnel.stream_count(), 3);
    }

    #[test]
    fn relays_a_client_through_the_tunnel() {
        let proxy_addr = free_addr();
        let event_loop = EventLoop::new().unwrap();
        let tunnel_listener =
            serve(&event_loop, "127.0.0.1:0".parse().unwrap(), proxy_addr).unwrap();
        let tunnel_addr = tunnel_listener.local_addr();

        let peer = thread::spawn(move || {
            let mut agent = StdTcpStream::connect(tunnel_addr).unwrap();
            let mut client = loop {
                match StdTcpStream::connect(proxy_addr) {
                    Ok(client) => break client,
                    Err(_) => thread::sleep(Duration::from_millis(10)),
                }
            };

            client.write_all(b"hello").unwrap();
            let opened = read_frame(&mut agent);
            assert_eq!(&opened.payload()[..], b"hello");
            let stream_id = opened.stream_id();

            let stray = Frame::data(stream_id + 1000, b"stray");
            agent.write_all(&stray.encode()).unwrap();
            agent.write_all(&Frame::data(stream_id, b"world").encode()).unwrap();
            agent.write_all(&Frame::close(stream_id).encode()).unwrap();

            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            received
        });

        let handle = event_loop.clone();
        event_loop.add_timeout(Duration::from_secs(10), move || handle.stop());

        // The agent socket drops when the thread ends.
        let result = event_loop.run();
        assert_eq!(peer.join().unwrap(), b"world");
        assert!(matches!(result, Err(Error::TunnelLost(_))));
        assert!(tunnel_listener.is_stopped());
    }

    #[test]
    fn client_hangup_sends_a_close_frame() {
        let proxy_addr = free_addr();
        let event_loop = EventLoop::new().unwrap();
        let tunnel_listener =
            serve(&event_loop, "127.0.0.1:0".parse().unwrap(), proxy_addr).unwrap();
        let tunnel_addr = tunnel_listener.local_addr();

        let peer = thread::spawn(move || {
            let mut agent = StdTcpStream::connect(tunnel_addr).unwrap();
            let mut client = loop {
                match StdTcpStream::connect(proxy_addr) {
                    Ok(client) => break client,
                    Err(_) => thread::sleep(Duration::from_millis(10)),
                }
            };

            client.write_all(b"bye").unwrap();
            let opened = read_frame(&mut agent);
            drop(client);
            (opened, read_frame(&mut agent))
        });

        let handle = event_loop.clone();
        event_loop.add_timeout(Duration::from_secs(10), move || handle.stop());
        let result = event_loop.run();

        let (opened, closed) = peer.join().unwrap();
        assert_eq!(opened, Frame::data(opened.stream_id(), b"bye"));
        assert_eq!(closed, Frame::close(opened.stream_id()));
        assert!(matches!(result, Err(Error::TunnelLost(_))));
    }
}

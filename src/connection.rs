use std::{
    cell::{Cell, RefCell},
    io::{self, Read, Write},
    rc::{Rc, Weak},
};

use bytes::{Buf, Bytes, BytesMut};
use mio::{net::TcpStream, Interest, Token};
use tracing::{debug, info, trace, warn};

use crate::event_loop::{Callback, EventLoop, Kind, Outcome};

/// Upper bound of a single read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Per-connection behavior plugged into a [`Connection`].
///
/// Every method gets the connection it is called for, so a handler can send
/// replies or close it from inside any reaction.
pub trait Handler {
    /// Called after every successful read with the new `chunk` and everything
    /// buffered so far (`chunk` included).
    ///
    /// Returns how many bytes from the front of `buffered` were consumed. The
    /// rest is kept and handed back, extended, on the next read.
    fn on_data(&self, conn: &Connection, chunk: &[u8], buffered: &[u8]) -> usize;

    /// `sent` is exactly the prefix of the write queue the OS accepted.
    fn on_sent(&self, _conn: &Connection, _sent: &[u8]) {}

    /// An outbound connect completed. Reads start only after this.
    fn on_connect(&self, _conn: &Connection) {}

    fn on_error(&self, _conn: &Connection, _err: &io::Error) {}

    fn on_remote_close(&self, _conn: &Connection) {}

    /// Local close finished; the write queue was drained.
    fn on_close(&self, _conn: &Connection) {}

    /// Runs exactly once per connection, whichever way it ended.
    fn on_destroy(&self, _conn: &Connection) {}
}

/// A non-blocking TCP socket with a read buffer, a write queue and
/// half-close handling.
pub struct Connection {
    this: Weak<Connection>,
    token: Token,
    name: String,
    event_loop: EventLoop,
    handler: Rc<dyn Handler>,
    stream: RefCell<Option<TcpStream>>,
    read_buf: RefCell<BytesMut>,
    write_buf: RefCell<BytesMut>,
    closing: Cell<bool>,
    connecting: Cell<bool>,
}

impl Connection {
    /// Registers `stream` with the loop. Nothing is read or written before
    /// the loop reports readiness.
    pub fn new(
        event_loop: &EventLoop,
        stream: TcpStream,
        name: impl Into<String>,
        handler: Rc<dyn Handler>,
    ) -> io::Result<Rc<Self>> {
        Self::open(event_loop, stream, name.into(), handler, false)
    }

    /// Like [`Connection::new`] for a socket whose connect is still in
    /// progress, such as one from [`TcpStream::connect`].
    ///
    /// Writes are queued until the connect settles. Success is reported
    /// through [`Handler::on_connect`], failure through the error path.
    pub fn connecting(
        event_loop: &EventLoop,
        stream: TcpStream,
        name: impl Into<String>,
        handler: Rc<dyn Handler>,
    ) -> io::Result<Rc<Self>> {
        Self::open(event_loop, stream, name.into(), handler, true)
    }

    fn open(
        event_loop: &EventLoop,
        mut stream: TcpStream,
        name: String,
        handler: Rc<dyn Handler>,
        connecting: bool,
    ) -> io::Result<Rc<Self>> {
        let token = event_loop.next_token();
        event_loop.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let conn = Rc::new_cyclic(|this| Connection {
            this: this.clone(),
            token,
            name,
            event_loop: event_loop.clone(),
            handler,
            stream: RefCell::new(Some(stream)),
            read_buf: RefCell::new(BytesMut::new()),
            write_buf: RefCell::new(BytesMut::new()),
            closing: Cell::new(false),
            connecting: Cell::new(connecting),
        });

        if connecting {
            event_loop.register(token, Kind::Writable, callback(&conn, Self::on_writable));
        } else {
            event_loop.register(token, Kind::Readable, callback(&conn, Self::on_readable));
        }
        event_loop.register(token, Kind::Error, callback(&conn, Self::on_error_ready));
        let c = conn.clone();
        event_loop.on_shutdown(token, move || c.destroy());

        info!(conn = %conn.name, connecting, "created");
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// True once [`Connection::close`] was requested.
    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    /// True until an outbound connect has completed. Stays true if it never did.
    pub fn is_connecting(&self) -> bool {
        self.connecting.get()
    }

    /// True once the socket has been released.
    pub fn is_destroyed(&self) -> bool {
        self.stream.borrow().is_none()
    }

    /// Bytes queued but not yet accepted by the OS.
    pub fn pending(&self) -> usize {
        self.write_buf.borrow().len()
    }

    /// Queues `data`. Never writes synchronously; ignored once closing.
    pub fn send(&self, data: &[u8]) {
        if self.closing.get() || data.is_empty() || self.is_destroyed() {
            return;
        }
        let was_idle = {
            let mut pending = self.write_buf.borrow_mut();
            let was_idle = pending.is_empty();
            pending.extend_from_slice(data);
            was_idle
        };
        if was_idle {
            if let Some(this) = self.this.upgrade() {
                self.event_loop
                    .register(self.token, Kind::Writable, callback(&this, Self::on_writable));
            }
        }
    }

    /// Stops reading and closes once everything queued has been written.
    pub fn close(&self) {
        if self.is_destroyed() {
            return;
        }
        self.closing.set(true);
        if self.write_buf.borrow().is_empty() {
            self.finish_close();
        } else {
            self.event_loop.unregister(self.token, Kind::Readable);
        }
    }

    fn on_readable(&self) -> Outcome {
        let mut chunk = [0; READ_CHUNK_SIZE];
        let read = match self.stream.borrow_mut().as_mut() {
            Some(stream) => stream.read(&mut chunk),
            None => return Outcome::WouldBlock,
        };

        match read {
            Ok(0) => {
                info!(conn = %self.name, "closed by remote");
                self.handler.on_remote_close(self);
                self.destroy();
                Outcome::WouldBlock
            }
            Ok(n) => {
                let chunk = &chunk[..n];
                debug!(conn = %self.name, bytes = n, "recv");
                trace!(conn = %self.name, data = ?Bytes::copy_from_slice(chunk), "recv dump");

                let mut buffered = std::mem::take(&mut *self.read_buf.borrow_mut());
                buffered.extend_from_slice(chunk);
                let consumed = self.handler.on_data(self, chunk, &buffered);
                buffered.advance(consumed.min(buffered.len()));
                if !self.is_destroyed() {
                    *self.read_buf.borrow_mut() = buffered;
                }
                Outcome::Progress
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Outcome::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Outcome::Progress,
            Err(err) => {
                self.fail(err);
                Outcome::WouldBlock
            }
        }
    }

    fn on_writable(&self) -> Outcome {
        if self.connecting.get() && !self.finish_connect() {
            return Outcome::WouldBlock;
        }

        let written = {
            let pending = self.write_buf.borrow();
            if pending.is_empty() {
                None
            } else {
                match self.stream.borrow_mut().as_mut() {
                    Some(stream) => Some(stream.write(&pending)),
                    None => return Outcome::WouldBlock,
                }
            }
        };

        match written {
            None => {}
            Some(Ok(0)) => {
                self.fail(io::ErrorKind::WriteZero.into());
                return Outcome::WouldBlock;
            }
            Some(Ok(n)) => {
                let sent = self.write_buf.borrow_mut().split_to(n).freeze();
                debug!(conn = %self.name, bytes = n, "sent");
                trace!(conn = %self.name, data = ?sent, "sent dump");
                self.handler.on_sent(self, &sent);
            }
            Some(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                return Outcome::WouldBlock;
            }
            Some(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {
                return Outcome::Progress;
            }
            Some(Err(err)) => {
                self.fail(err);
                return Outcome::WouldBlock;
            }
        }

        if self.is_destroyed() {
            return Outcome::WouldBlock;
        }
        if !self.write_buf.borrow().is_empty() {
            return Outcome::Progress;
        }
        if self.closing.get() {
            self.finish_close();
            return Outcome::WouldBlock;
        }
        // Drained: the socket stays writable, so keep the ready flag and only
        // drop the callback until the next `send`.
        self.event_loop.unregister(self.token, Kind::Writable);
        Outcome::Progress
    }

    /// Settles a pending connect. Returns whether the socket is connected.
    fn finish_connect(&self) -> bool {
        let status = match self.stream.borrow().as_ref() {
            Some(stream) => connect_status(stream),
            None => return false,
        };

        match status {
            Ok(true) => {
                self.connecting.set(false);
                info!(conn = %self.name, "connected");
                if let Some(this) = self.this.upgrade() {
                    self.event_loop
                        .register(self.token, Kind::Readable, callback(&this, Self::on_readable));
                }
                self.handler.on_connect(self);
                !self.is_destroyed()
            }
            // Spurious wakeup, wait for the next edge.
            Ok(false) => false,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    fn on_error_ready(&self) -> Outcome {
        let err = self
            .stream
            .borrow()
            .as_ref()
            .and_then(|stream| stream.take_error().ok().flatten())
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
        self.fail(err);
        Outcome::WouldBlock
    }

    fn fail(&self, err: io::Error) {
        warn!(conn = %self.name, %err, "encountered error");
        self.handler.on_error(self, &err);
        self.destroy();
    }

    fn finish_close(&self) {
        info!(conn = %self.name, "closed");
        self.handler.on_close(self);
        self.destroy();
    }

    fn destroy(&self) {
        let Some(mut stream) = self.stream.borrow_mut().take() else {
            return;
        };
        self.event_loop.unregister_all(self.token);
        if let Err(err) = self.event_loop.registry().deregister(&mut stream) {
            debug!(conn = %self.name, %err, "deregister failed");
        }
        drop(stream);
        self.read_buf.borrow_mut().clear();
        self.write_buf.borrow_mut().clear();

        debug!(conn = %self.name, "destroyed");
        self.handler.on_destroy(self);
    }
}

fn connect_status(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err),
    }
}

fn callback(conn: &Rc<Connection>, react: fn(&Connection) -> Outcome) -> Callback {
    let conn = conn.clone();
    Rc::new(move || -> crate::Result<Outcome> { Ok(react(&conn)) })
}

use std::{cell::RefCell, io, net::SocketAddr, rc::Rc};

use mio::{
    net::{TcpListener, TcpStream},
    Interest, Token,
};
use tracing::{debug, error, info};

use crate::{
    event_loop::{EventLoop, Kind, Outcome},
    Error, Result,
};

type AcceptHandler = Box<dyn Fn(&Listener, TcpStream, SocketAddr) -> Result<()>>;

/// Accepts inbound connections and hands each one to its accept handler.
///
/// The accepted socket belongs to the handler from then on.
pub struct Listener {
    token: Token,
    name: String,
    local_addr: SocketAddr,
    event_loop: EventLoop,
    socket: RefCell<Option<TcpListener>>,
    on_accept: AcceptHandler,
}

impl Listener {
    /// Binds `addr` and starts accepting once the loop runs.
    ///
    /// An error returned by `on_accept` escapes the loop and stops it.
    pub fn bind<F>(
        event_loop: &EventLoop,
        name: &str,
        addr: SocketAddr,
        on_accept: F,
    ) -> Result<Rc<Self>>
    where
        F: Fn(&Listener, TcpStream, SocketAddr) -> Result<()> + 'static,
    {
        let mut socket = TcpListener::bind(addr).map_err(|source| {
            error!(listener = name, %addr, %source, "failed to start");
            Error::Bind { addr, source }
        })?;
        let local_addr = socket.local_addr()?;

        let token = event_loop.next_token();
        event_loop
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;

        let listener = Rc::new(Listener {
            token,
            name: format!("{name}<{local_addr}>"),
            local_addr,
            event_loop: event_loop.clone(),
            socket: RefCell::new(Some(socket)),
            on_accept: Box::new(on_accept),
        });

        let l = listener.clone();
        event_loop.register(token, Kind::Readable, Rc::new(move || l.accept()));
        let l = listener.clone();
        event_loop.register(
            token,
            Kind::Error,
            Rc::new(move || -> Result<Outcome> {
                error!(listener = %l.name, "encountered error");
                l.stop();
                Ok(Outcome::WouldBlock)
            }),
        );
        let l = listener.clone();
        event_loop.on_shutdown(token, move || l.stop());

        info!(listener = %listener.name, "started");
        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.socket.borrow().is_none()
    }

    /// Closes this listener. Connections it already accepted are unaffected.
    pub fn stop(&self) {
        let Some(mut socket) = self.socket.borrow_mut().take() else {
            return;
        };
        self.event_loop.unregister_all(self.token);
        if let Err(err) = self.event_loop.registry().deregister(&mut socket) {
            debug!(listener = %self.name, %err, "deregister failed");
        }
        info!(listener = %self.name, "stopped");
    }

    fn accept(&self) -> Result<Outcome> {
        let accepted = match self.socket.borrow().as_ref() {
            Some(socket) => socket.accept(),
            None => return Ok(Outcome::WouldBlock),
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(listener = %self.name, %addr, "accepted");
                (self.on_accept)(self, stream, addr)?;
                Ok(Outcome::Progress)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Outcome::WouldBlock),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                Ok(Outcome::Progress)
            }
            Err(err) => {
                error!(listener = %self.name, %err, "encountered error");
                self.stop();
                Ok(Outcome::WouldBlock)
            }
        }
    }
}

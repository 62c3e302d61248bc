use std::io;

use mio::net::TcpStream;
use tracing::debug;

use crate::protocol::SocksSocketAddr;

use super::Connect;

/// Dials the requested destination directly.
///
/// Only the connect is started here; refusal surfaces later on the loop.
pub struct TunnelConnect;

impl Connect for TunnelConnect {
    fn establish_connection(&self, destination: &SocksSocketAddr) -> io::Result<TcpStream> {
        let addr = destination.to_socket_addr()?;
        debug!(%destination, %addr, "connecting");
        TcpStream::connect(addr)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener};

    use super::*;
    use crate::protocol::Addr;

    #[test]
    fn connect_is_started_without_waiting() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
            unreachable!("bound to an IPv4 address");
        };

        let stream = TunnelConnect.establish_connection(&addr.into()).unwrap();
        let (_, peer) = listener.accept().unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[test]
    fn unresolvable_domain_is_an_error() {
        let destination = SocksSocketAddr {
            addr: Addr::Domain("no-such-host.invalid".into()),
            port: 80,
        };
        assert!(TunnelConnect.establish_connection(&destination).is_err());
    }
}

use std::io;

use mio::net::TcpStream;

pub mod connect_denier;
pub mod tunnel_connect;
use crate::protocol::SocksSocketAddr;

/// The `Connect` trait opens the outbound side of a SOCKS5 CONNECT request.
///
/// The agent calls it once per stream, as soon as the request is parsed. It
/// must not block: the returned stream is non-blocking and may still be
/// connecting. The agent replies to the client once the loop reports the
/// connect's outcome.
pub trait Connect {
    /// Starts connecting to `destination`.
    ///
    /// An error makes the agent answer with a host-unreachable reply and
    /// tear the stream down, as does a connect that later fails.
    fn establish_connection(&self, destination: &SocksSocketAddr) -> io::Result<TcpStream>;
}

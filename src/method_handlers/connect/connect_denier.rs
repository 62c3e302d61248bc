use std::io;

use mio::net::TcpStream;

use crate::protocol::SocksSocketAddr;

use super::Connect;

/// Refuses every CONNECT request.
pub struct ConnectDenier;

impl Connect for ConnectDenier {
    fn establish_connection(&self, destination: &SocksSocketAddr) -> io::Result<TcpStream> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("connections to {destination} are not allowed"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_everything() {
        let err = ConnectDenier
            .establish_connection(&SocksSocketAddr::unspecified(80))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}

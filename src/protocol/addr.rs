use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs},
};

use crate::handshake::Socks5Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
}

impl AddressType {
    /// IPv6 (0x04) is not relayed and maps to `None` like any unknown type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl SocksSocketAddr {
    /// `0.0.0.0:port`, the bound address put in every CONNECT reply.
    pub fn unspecified(port: u16) -> Self {
        SocksSocketAddr {
            port,
            addr: Addr::Ipv4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Turns `Self` into: AddrType+ADDR+PORT
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(7);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Domain(domain) => {
                bytes.push(domain.len() as u8);
                bytes.extend_from_slice(domain.as_bytes())
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        bytes
    }

    /// Parses AddrType+ADDR+PORT from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the address is still incomplete, otherwise the
    /// address and the number of bytes it took.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, Socks5Error> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };

        let (addr, addr_len) = match AddressType::from_u8(atyp) {
            Some(AddressType::Ipv4) => {
                let Some(octets) = buf.get(1..5) else {
                    return Ok(None);
                };
                let octets: [u8; 4] = [octets[0], octets[1], octets[2], octets[3]];
                (Addr::Ipv4(Ipv4Addr::from(octets)), 4)
            }
            Some(AddressType::DomainName) => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                let Some(name) = buf.get(2..2 + len) else {
                    return Ok(None);
                };
                let domain = std::str::from_utf8(name).map_err(|_| Socks5Error::InvalidDomain)?;
                if domain.is_empty() {
                    return Err(Socks5Error::InvalidDomain);
                }
                (Addr::Domain(domain.to_owned()), 1 + len)
            }
            None => return Err(Socks5Error::UnsupportedAddressType(atyp)),
        };

        let port_at = 1 + addr_len;
        let Some(port) = buf.get(port_at..port_at + 2) else {
            return Ok(None);
        };
        let port = u16::from_be_bytes([port[0], port[1]]);

        Ok(Some((SocksSocketAddr { port, addr }, port_at + 2)))
    }

    /// Resolves the destination. Domains take the first address the system
    /// resolver returns.
    pub fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        match &self.addr {
            Addr::Ipv4(addr) => Ok(SocketAddrV4::new(*addr, self.port).into()),
            Addr::Domain(domain) => (domain.as_str(), self.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{domain} did not resolve to any address"),
                    )
                }),
        }
    }
}

impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv4(addr) => write!(f, "{}:{}", addr, self.port),
            Addr::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

impl From<SocketAddrV4> for SocksSocketAddr {
    fn from(value: SocketAddrV4) -> Self {
        SocksSocketAddr {
            port: value.port(),
            addr: Addr::Ipv4(*value.ip()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}

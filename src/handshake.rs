//! The server half of the SOCKS5 CONNECT handshake, run by the agent for
//! every stream it has not yet connected.
//!
//! The state machine is fed raw tunnel payloads and tolerates messages split
//! or pipelined across frames.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::{AuthMethod, Command, SocksSocketAddr, VERSION};

/// VER+CMD+RSV+ATYP plus the shortest address part worth looking at.
const MIN_REQUEST_LEN: usize = 7;
/// VER+NMETHODS+at least one method.
const MIN_GREETING_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for VER+NMETHODS+METHODS.
    Greeting,
    /// Waiting for VER+CMD+RSV+ATYP+DST.ADDR+DST.PORT.
    Request,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Greeting => write!(f, "greeting"),
            Stage::Request => write!(f, "request"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("Invalid SOCKS version {version:#04x} in {stage}")]
    InvalidVersion { stage: Stage, version: u8 },
    #[error("No acceptable authentication method offered")]
    NoAcceptableMethods,
    #[error("Unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("Unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("Invalid domain name")]
    InvalidDomain,
}

impl Socks5Error {
    /// The method-selection reply owed to the client before the stream is torn
    /// down. Request-stage failures get no reply.
    pub fn reply(&self) -> Option<[u8; 2]> {
        match self {
            Socks5Error::InvalidVersion {
                stage: Stage::Greeting,
                ..
            }
            | Socks5Error::NoAcceptableMethods => {
                Some([VERSION, AuthMethod::NoAcceptableMethods.to_u8()])
            }
            _ => None,
        }
    }
}

/// What a call to [`Handshake::advance`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// More bytes are needed before anything can be decided.
    Incomplete,
    /// The greeting was accepted; answer with `VER` + this method.
    Greeted(AuthMethod),
    /// The CONNECT request is complete.
    Connect(SocksSocketAddr),
}

#[derive(Debug)]
pub struct Handshake {
    stage: Stage,
    buf: BytesMut,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Handshake {
            stage: Stage::Greeting,
            buf: BytesMut::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Bytes received but not yet consumed by a completed message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Consumes at most one complete message from the buffer.
    ///
    /// Call again after [`Step::Greeted`]: a pipelined request may already be
    /// buffered. After [`Step::Connect`] the handshake is over and
    /// [`Handshake::into_remainder`] yields the first application bytes.
    pub fn advance(&mut self) -> Result<Step, Socks5Error> {
        match self.stage {
            Stage::Greeting => self.greeting(),
            Stage::Request => self.request(),
        }
    }

    pub fn into_remainder(self) -> Bytes {
        self.buf.freeze()
    }

    fn greeting(&mut self) -> Result<Step, Socks5Error> {
        if self.buf.len() < MIN_GREETING_LEN {
            return Ok(Step::Incomplete);
        }
        let methods = self.buf[1] as usize;
        if self.buf.len() - 2 < methods {
            return Ok(Step::Incomplete);
        }
        if self.buf[0] != VERSION {
            return Err(Socks5Error::InvalidVersion {
                stage: Stage::Greeting,
                version: self.buf[0],
            });
        }

        let method = AuthMethod::negotiate(&self.buf[2..2 + methods]);
        if method == AuthMethod::NoAcceptableMethods {
            return Err(Socks5Error::NoAcceptableMethods);
        }

        self.buf.advance(2 + methods);
        self.stage = Stage::Request;
        Ok(Step::Greeted(method))
    }

    fn request(&mut self) -> Result<Step, Socks5Error> {
        if self.buf.len() < MIN_REQUEST_LEN {
            return Ok(Step::Incomplete);
        }
        if self.buf[0] != VERSION {
            return Err(Socks5Error::InvalidVersion {
                stage: Stage::Request,
                version: self.buf[0],
            });
        }
        if Command::from_u8(self.buf[1]) != Some(Command::Connect) {
            return Err(Socks5Error::UnsupportedCommand(self.buf[1]));
        }

        match SocksSocketAddr::decode(&self.buf[3..])? {
            None => Ok(Step::Incomplete),
            Some((destination, used)) => {
                self.buf.advance(3 + used);
                Ok(Step::Connect(destination))
            }
        }
    }
}

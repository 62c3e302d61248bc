use super::{SocksSocketAddr, RESERVED, VERSION};

/// The reply codes the agent sends to a CONNECT request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success = 0x00,
    HostUnreachable = 0x04,
}

impl Reply {
    pub fn to_u8(&self) -> u8 {
        *self as u8
    }

    /// Encodes the answer to a CONNECT request: VER+REP+RSV+ATYP+ADDR+PORT
    pub fn to_bytes(self, bound: &SocksSocketAddr) -> Vec<u8> {
        let mut bytes = vec![VERSION, self.to_u8(), RESERVED];
        bytes.extend_from_slice(&bound.to_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_carry_placeholder_address() {
        let bound = SocksSocketAddr::unspecified(1080);
        assert_eq!(
            Reply::Success.to_bytes(&bound),
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x04, 0x38]
        );
        assert_eq!(
            Reply::HostUnreachable.to_bytes(&bound),
            [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0x04, 0x38]
        );
    }
}

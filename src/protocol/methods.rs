const NO_AUTH_REQUIRED: u8 = 0x00;
const GSSAPI: u8 = 0x01;
const USERNAME_PASSWORD: u8 = 0x02;

const IANA_ASSIGNED_LOWER: u8 = 0x03;
const IANA_ASSIGNED_UPPER: u8 = 0x7F;

const PRIVATE_METHOD_LOWER: u8 = 0x80;
const PRIVATE_METHOD_UPPER: u8 = 0xFE;

const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// Authentication methods a client may offer in its greeting.
///
/// Only [`AuthMethod::NoAuthRequired`] is ever selected; everything else is
/// parsed so it can be logged.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthMethod {
    NoAuthRequired,
    Gssapi,
    UsernamePassword,
    IanaAssigned(u8),
    PrivateMethods(u8),
    /// Sent back when none of the offered methods is usable.
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            NO_AUTH_REQUIRED => AuthMethod::NoAuthRequired,
            GSSAPI => AuthMethod::Gssapi,
            USERNAME_PASSWORD => AuthMethod::UsernamePassword,
            IANA_ASSIGNED_LOWER..=IANA_ASSIGNED_UPPER => AuthMethod::IanaAssigned(value),
            PRIVATE_METHOD_LOWER..=PRIVATE_METHOD_UPPER => AuthMethod::PrivateMethods(value),
            NO_ACCEPTABLE_METHODS => AuthMethod::NoAcceptableMethods,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuthRequired => NO_AUTH_REQUIRED,
            AuthMethod::Gssapi => GSSAPI,
            AuthMethod::UsernamePassword => USERNAME_PASSWORD,
            AuthMethod::IanaAssigned(value) => value,
            AuthMethod::PrivateMethods(value) => value,
            AuthMethod::NoAcceptableMethods => NO_ACCEPTABLE_METHODS,
        }
    }

    /// Picks the method to answer a greeting with.
    pub fn negotiate(offered: &[u8]) -> Self {
        offered
            .iter()
            .map(|method| AuthMethod::from_u8(*method))
            .find(|method| *method == AuthMethod::NoAuthRequired)
            .unwrap_or(AuthMethod::NoAcceptableMethods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_requires_no_auth() {
        assert_eq!(AuthMethod::negotiate(&[0x02, 0x00]), AuthMethod::NoAuthRequired);
        assert_eq!(AuthMethod::negotiate(&[0x01]), AuthMethod::NoAcceptableMethods);
        assert_eq!(AuthMethod::negotiate(&[]), AuthMethod::NoAcceptableMethods);
    }

    #[test]
    fn every_byte_round_trips() {
        for value in 0..=u8::MAX {
            assert_eq!(AuthMethod::from_u8(value).to_u8(), value);
        }
    }
}

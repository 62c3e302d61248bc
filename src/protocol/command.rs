/// The only request command served. BIND and UDP ASSOCIATE are refused like
/// any unknown code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Command::Connect),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connect_is_recognized() {
        assert_eq!(Command::from_u8(0x01), Some(Command::Connect));
        // BIND, UDP ASSOCIATE
        assert_eq!(Command::from_u8(0x02), None);
        assert_eq!(Command::from_u8(0x03), None);
        assert_eq!(Command::Connect.to_u8(), 0x01);
    }
}

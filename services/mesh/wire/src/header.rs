//! Message type tags for the wire protocol.
//!
//! Every frame carries a one-byte type tag right after its length prefix.
//! HELLO and BYE are link control; every other tag, known or not, belongs to
//! the election protocol and is handed to the consensus layer untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the type tag in bytes
pub const TYPE_TAG_SIZE: usize = 1;

/// Message types as defined in the wire protocol
///
/// Tags outside the named set decode to [`MessageType::Application`] so that
/// newer election messages pass through to the consensus layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Hello frame binding a link to a peer identity
    Hello,
    /// Bye frame for link termination
    Bye,
    /// Election start (candidate asks higher-ranked peers)
    Election,
    /// Answer to an election from a higher-ranked peer
    Alive,
    /// Announcement of the elected leader
    Victory,
    /// Periodic leader heartbeat
    Heartbeat,
    /// Any other application tag, carried as is
    Application(u8),
}

impl MessageType {
    /// Tag byte written on the wire
    pub fn tag(self) -> u8 {
        match self {
            MessageType::Hello => 0x01,
            MessageType::Bye => 0x02,
            MessageType::Election => 0x10,
            MessageType::Alive => 0x11,
            MessageType::Victory => 0x12,
            MessageType::Heartbeat => 0x13,
            MessageType::Application(tag) => tag,
        }
    }

    /// Whether this type is handled by the link itself rather than the consensus layer
    pub fn is_control(self) -> bool {
        matches!(self, MessageType::Hello | MessageType::Bye)
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => MessageType::Hello,
            0x02 => MessageType::Bye,
            0x10 => MessageType::Election,
            0x11 => MessageType::Alive,
            0x12 => MessageType::Victory,
            0x13 => MessageType::Heartbeat,
            tag => MessageType::Application(tag),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Hello => f.write_str("Hello"),
            MessageType::Bye => f.write_str("Bye"),
            MessageType::Election => f.write_str("Election"),
            MessageType::Alive => f.write_str("Alive"),
            MessageType::Victory => f.write_str("Victory"),
            MessageType::Heartbeat => f.write_str("Heartbeat"),
            MessageType::Application(tag) => write!(f, "Application(0x{:02x})", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        for typ in [
            MessageType::Hello,
            MessageType::Bye,
            MessageType::Election,
            MessageType::Alive,
            MessageType::Victory,
            MessageType::Heartbeat,
        ] {
            assert_eq!(MessageType::from(typ.tag()), typ);
        }

        let unknown = MessageType::from(0xEE);
        assert_eq!(unknown, MessageType::Application(0xEE));
        assert_eq!(unknown.tag(), 0xEE);
        assert_eq!(unknown.to_string(), "Application(0xee)");
        assert_eq!(MessageType::from(0x01), MessageType::Hello);
    }

    #[test]
    fn test_control_types() {
        assert!(MessageType::Hello.is_control());
        assert!(MessageType::Bye.is_control());
        assert!(!MessageType::Election.is_control());
        assert!(!MessageType::Heartbeat.is_control());
        assert!(!MessageType::Application(0x20).is_control());
    }
}

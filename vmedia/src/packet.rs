use crate::error::MediaError;

/// Kind of payload a packet carries, stored on disk as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PacketType {
    Video,
    Audio,
    Meta,
}

impl PacketType {
    /// On-disk byte code for this packet type.
    pub fn code(self) -> u8 {
        match self {
            PacketType::Video => 0,
            PacketType::Audio => 1,
            PacketType::Meta => 2,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = MediaError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Video),
            1 => Ok(PacketType::Audio),
            2 => Ok(PacketType::Meta),
            other => Err(MediaError::UnknownPacketType(other)),
        }
    }
}

/// A single timestamped media packet.
///
/// Ownership transfers from the caller to the active chunk on write.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Packet {
    /// Raw payload bytes (codec bitstream, opaque to this crate).
    pub data: Vec<u8>,
    /// Payload kind.
    pub packet_type: PacketType,
    /// Whether this is an independently decodable video frame. Only key
    /// frames may trigger a chunk boundary.
    pub is_key_frame: bool,
    /// Timestamp in caller-defined ticks.
    pub time: i64,
}

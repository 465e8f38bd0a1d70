use crate::error::{MediaError, Result};
use crate::packet::{Packet, PacketType};

/// Fixed byte sequence marking the start of a chunk record in the raw
/// stream.
pub const CHUNK_MAGIC: [u8; 4] = *b"FCHK";

/// Bytes of framing before the payload: MAGIC plus the 4-byte big-endian
/// payload length.
pub const CHUNK_HEADER_LEN: usize = CHUNK_MAGIC.len() + 4;

/// Minimum number of packets the active chunk must hold before a video
/// key frame is allowed to flush it. Bounds chunk size for seek
/// granularity and avoids one-frame chunks.
pub const CHUNK_MIN_FRAME_COUNT: usize = 5;

/// Fixed-size prefix of the chunk payload, before the packet list:
/// index(4) + start_time(8) + end_time(8) + prev_chunk_size(4) +
/// prev_chunk_start(4) + packet_count(4).
const PAYLOAD_FIXED_LEN: usize = 32;

/// Fixed-size prefix of each serialized packet: time(8) + type(1) +
/// key_frame(1) + data_len(4).
const PACKET_FIXED_LEN: usize = 14;

/// A batch of consecutive packets persisted as one self-delimited binary
/// record; the unit of flush and of seek granularity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PacketChunk {
    /// 1-based chunk index, strictly increasing per virtual file.
    pub index: u32,
    /// Timestamp of the first video packet in this chunk.
    pub start_time: i64,
    /// Timestamp of the last video packet in this chunk.
    pub end_time: i64,
    /// Packets in insertion order.
    pub packets: Vec<Packet>,
    /// On-disk size of the preceding chunk's record, including framing.
    pub prev_chunk_size: u32,
    /// Byte offset of the preceding chunk's record in the virtual file.
    pub prev_chunk_start: u32,
}

impl PacketChunk {
    /// A fresh chunk with no linkage, as allocated when a virtual file is
    /// created.
    pub fn first() -> Self {
        PacketChunk {
            index: 1,
            start_time: 0,
            end_time: 0,
            packets: Vec::new(),
            prev_chunk_size: 0,
            prev_chunk_start: 0,
        }
    }

    /// Whether `time` falls inside this chunk's time window.
    pub fn covers(&self, time: i64) -> bool {
        self.start_time <= time && time <= self.end_time
    }
}

/// File-level time range, persisted through the storage side channel
/// after every flush and used to approximate byte offsets when seeking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MediaInfo {
    pub start_time: i64,
    pub end_time: i64,
}

/// Serialize a chunk to its on-disk record:
/// `MAGIC || u32 BE payload length || payload`.
///
/// Deterministic: the same chunk always yields the same bytes.
pub fn encode_chunk(chunk: &PacketChunk) -> Vec<u8> {
    let payload_len: usize = PAYLOAD_FIXED_LEN
        + chunk
            .packets
            .iter()
            .map(|p| PACKET_FIXED_LEN + p.data.len())
            .sum::<usize>();

    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + payload_len);
    out.extend_from_slice(&CHUNK_MAGIC);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());

    out.extend_from_slice(&chunk.index.to_be_bytes());
    out.extend_from_slice(&chunk.start_time.to_be_bytes());
    out.extend_from_slice(&chunk.end_time.to_be_bytes());
    out.extend_from_slice(&chunk.prev_chunk_size.to_be_bytes());
    out.extend_from_slice(&chunk.prev_chunk_start.to_be_bytes());
    out.extend_from_slice(&(chunk.packets.len() as u32).to_be_bytes());

    for packet in &chunk.packets {
        out.extend_from_slice(&packet.time.to_be_bytes());
        out.push(packet.packet_type.code());
        out.push(packet.is_key_frame as u8);
        out.extend_from_slice(&(packet.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&packet.data);
    }

    out
}

/// Deserialize a full chunk record starting exactly at a MAGIC boundary.
///
/// Used by the backward navigator, which reads a whole record at a known
/// address. Forward scanning decodes the payload window directly via
/// [`decode_chunk_payload`].
pub fn decode_chunk(record: &[u8]) -> Result<PacketChunk> {
    if record.len() < CHUNK_HEADER_LEN {
        return Err(MediaError::Truncated {
            needed: CHUNK_HEADER_LEN,
            got: record.len(),
        });
    }
    if record[..CHUNK_MAGIC.len()] != CHUNK_MAGIC {
        let mut got = [0u8; 4];
        got.copy_from_slice(&record[..4]);
        return Err(MediaError::BadMagic { offset: 0, got });
    }
    let payload_len = read_u32(record, CHUNK_MAGIC.len())? as usize;
    let end = CHUNK_HEADER_LEN + payload_len;
    if record.len() < end {
        return Err(MediaError::Truncated {
            needed: end,
            got: record.len(),
        });
    }
    decode_chunk_payload(&record[CHUNK_HEADER_LEN..end])
}

/// Deserialize a chunk from a payload window of exactly the declared
/// LENGTH.
///
/// On failure the caller can still resynchronize the stream by skipping
/// `MAGIC size + LENGTH` bytes from the magic position.
pub fn decode_chunk_payload(payload: &[u8]) -> Result<PacketChunk> {
    let index = read_u32(payload, 0)?;
    let start_time = read_i64(payload, 4)?;
    let end_time = read_i64(payload, 12)?;
    let prev_chunk_size = read_u32(payload, 20)?;
    let prev_chunk_start = read_u32(payload, 24)?;
    let packet_count = read_u32(payload, 28)? as usize;

    let mut packets = Vec::with_capacity(packet_count.min(1024));
    let mut pos = PAYLOAD_FIXED_LEN;
    for _ in 0..packet_count {
        let time = read_i64(payload, pos)?;
        let type_byte = read_u8(payload, pos + 8)?;
        let key_byte = read_u8(payload, pos + 9)?;
        let data_len = read_u32(payload, pos + 10)? as usize;
        pos += PACKET_FIXED_LEN;

        let data = payload
            .get(pos..pos + data_len)
            .ok_or(MediaError::Truncated {
                needed: pos + data_len,
                got: payload.len(),
            })?
            .to_vec();
        pos += data_len;

        packets.push(Packet {
            data,
            packet_type: PacketType::try_from(type_byte)?,
            is_key_frame: key_byte != 0,
            time,
        });
    }

    if pos != payload.len() {
        return Err(MediaError::TrailingBytes(payload.len() - pos));
    }

    Ok(PacketChunk {
        index,
        start_time,
        end_time,
        packets,
        prev_chunk_size,
        prev_chunk_start,
    })
}

/// Serialize the file-level time range for the storage side channel.
pub fn encode_info(info: &MediaInfo) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&info.start_time.to_be_bytes());
    out[8..].copy_from_slice(&info.end_time.to_be_bytes());
    out
}

/// Deserialize the file-level time range from the storage side channel.
pub fn decode_info(data: &[u8]) -> Result<MediaInfo> {
    if data.len() != 16 {
        return Err(MediaError::BadInfoLength(data.len()));
    }
    Ok(MediaInfo {
        start_time: read_i64(data, 0)?,
        end_time: read_i64(data, 8)?,
    })
}

fn read_u8(buf: &[u8], offset: usize) -> Result<u8> {
    buf.get(offset).copied().ok_or(MediaError::Truncated {
        needed: offset + 1,
        got: buf.len(),
    })
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(MediaError::Truncated {
            needed: offset + 4,
            got: buf.len(),
        })
}

fn read_i64(buf: &[u8], offset: usize) -> Result<i64> {
    buf.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or(MediaError::Truncated {
            needed: offset + 8,
            got: buf.len(),
        })
}

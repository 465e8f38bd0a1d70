use log::warn;

use crate::chunk::{self, CHUNK_HEADER_LEN, CHUNK_MAGIC, PacketChunk};
use crate::error::{MediaError, Result};
use crate::storage::VirtualFile;

/// Declared payload lengths above this are treated as payload bytes that
/// happen to match the magic marker, not as a real record. Chunks are
/// bounded by the flush policy and stay far below this.
pub const MAX_CHUNK_PAYLOAD: usize = 64 << 20;

/// Turns a block-oriented virtual file into a logical stream of chunk
/// records.
///
/// Holds the tail of bytes pulled from storage but not yet consumed;
/// successful decodes drain the consumed prefix so memory stays bounded
/// and no byte is scanned twice.
pub struct ChunkScanner {
    buf: Vec<u8>,
    block_size: usize,
}

impl ChunkScanner {
    pub fn new(block_size: u32) -> Self {
        ChunkScanner {
            buf: Vec::new(),
            block_size: block_size.max(1) as usize,
        }
    }

    /// Discard buffered bytes. Required after repositioning the
    /// underlying file, since buffered bytes belong to the old position.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Assemble and decode the next chunk record from the stream.
    ///
    /// Reads one block at a time from `file` until a full
    /// MAGIC+LENGTH+PAYLOAD window is buffered. Returns
    /// [`MediaError::EndOfStream`] when storage runs out of bytes before
    /// a record completes. On payload decode failure the resync span
    /// (magic size + declared length) is dropped before the error is
    /// returned, so the following call continues cleanly.
    pub fn next_chunk(&mut self, file: &dyn VirtualFile) -> Result<PacketChunk> {
        let mut tmp = vec![0u8; self.block_size];
        // Confirmed magic position and its declared payload length.
        let mut pending: Option<(usize, usize)> = None;
        let mut search_from = 0usize;

        loop {
            while pending.is_none() {
                let Some(rel) = find_magic(&self.buf[search_from..]) else {
                    // No match; keep only a partial-magic tail in scope
                    // for the next pass.
                    search_from = self
                        .buf
                        .len()
                        .saturating_sub(CHUNK_MAGIC.len() - 1)
                        .max(search_from);
                    break;
                };
                let pos = search_from + rel;
                if self.buf.len() < pos + CHUNK_HEADER_LEN {
                    // Length field not buffered yet.
                    search_from = pos;
                    break;
                }
                let len = u32::from_be_bytes(
                    self.buf[pos + CHUNK_MAGIC.len()..pos + CHUNK_HEADER_LEN]
                        .try_into()
                        .unwrap_or_default(),
                ) as usize;
                if len > MAX_CHUNK_PAYLOAD {
                    warn!(
                        "implausible chunk payload length {len} at scan offset {pos}, \
                         skipping false-positive magic match"
                    );
                    search_from = pos + CHUNK_MAGIC.len();
                    continue;
                }
                pending = Some((pos, len));
            }

            if let Some((pos, len)) = pending {
                let end = pos + CHUNK_HEADER_LEN + len;
                if self.buf.len() >= end {
                    let result = chunk::decode_chunk_payload(&self.buf[pos + CHUNK_HEADER_LEN..end]);
                    let consumed = match &result {
                        Ok(_) => end,
                        Err(_) => pos + CHUNK_MAGIC.len() + len,
                    };
                    self.buf.drain(..consumed);
                    return result;
                }
            }

            let n = file.read(&mut tmp)?;
            if n == 0 {
                return Err(MediaError::EndOfStream);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(CHUNK_MAGIC.len())
        .position(|w| w == CHUNK_MAGIC)
}

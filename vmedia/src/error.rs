use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("virtual media file is read only")]
    ReadOnly,

    #[error("bad chunk magic at record offset {offset}: got {got:02X?}")]
    BadMagic { offset: usize, got: [u8; 4] },

    #[error("truncated chunk record: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown packet type byte 0x{0:02X}")]
    UnknownPacketType(u8),

    #[error("chunk payload has {0} bytes left over after the last packet")]
    TrailingBytes(usize),

    #[error("media info payload must be 16 bytes, got {0}")]
    BadInfoLength(usize),

    #[error("end of chunk stream")]
    EndOfStream,

    #[error("there is no previous chunk")]
    NoPreviousChunk,

    #[error("no chunk covers time {0}")]
    TimeNotFound(i64),

    #[error("virtual media file {0} is already open")]
    AlreadyOpen(u32),

    #[error("virtual media file {0} not found")]
    NotFound(u32),
}

pub type Result<T> = std::result::Result<T, MediaError>;

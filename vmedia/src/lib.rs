//! Append-only, chunked packet store for virtual media files.
//!
//! Many independent, time-ordered packet streams are multiplexed inside
//! shared block storage: packets accumulate in a per-file write buffer,
//! flush as self-delimited binary chunk records on video key-frame
//! boundaries, and are read back sequentially or by approximate
//! time-seek.
//!
//! Entry points: [`archiver::Archiver`] maps file IDs to open
//! [`session::VirtualMedia`] sessions over a [`storage::FileSystem`]
//! provider.

pub mod archiver;
pub mod chunk;
pub mod error;
pub mod packet;
pub mod scanner;
pub mod session;
pub mod storage;

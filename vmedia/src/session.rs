use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use log::{error, warn};

use crate::archiver::Registry;
use crate::chunk::{self, CHUNK_MIN_FRAME_COUNT, MediaInfo, PacketChunk};
use crate::error::{MediaError, Result};
use crate::packet::{Packet, PacketType};
use crate::scanner::ChunkScanner;
use crate::storage::{VirtualFile, lock};

struct WriteState {
    /// Chunk currently accumulating packets.
    chunk: PacketChunk,
    /// Running size of the virtual file, advanced only after a storage
    /// write succeeds.
    file_size: u32,
}

struct ReadState {
    scanner: ChunkScanner,
    /// Chunk the read cursor currently sits in.
    chunk: Option<PacketChunk>,
    /// Index of the next packet to return from `chunk`.
    frame_idx: usize,
}

/// One open virtual media file: an append-only, time-ordered packet
/// stream inside shared block storage.
///
/// The write path (buffer append, flush) and the read path (cursor,
/// scanner, navigator, seek) are guarded by two independent locks, so a
/// live writer and a live reader never block each other. The read path
/// observes writer progress only by re-reading storage; it is pull-based
/// and eventually consistent. Where both locks are taken together the
/// order is always write then read.
pub struct VirtualMedia {
    name: String,
    file_id: u32,
    block_size: u32,
    read_only: bool,
    file: Arc<dyn VirtualFile>,
    registry: Arc<dyn Registry>,
    // File-level time range, shared across both paths without taking
    // either lock. Advisory for seeking: a stale value only worsens the
    // approximate jump, which the correction loop absorbs.
    info_start: AtomicI64,
    info_end: AtomicI64,
    writer: Mutex<WriteState>,
    reader: Mutex<ReadState>,
}

impl VirtualMedia {
    /// Writable session over a freshly created virtual file. The active
    /// chunk starts at index 1.
    pub fn new(
        name: impl Into<String>,
        file_id: u32,
        block_size: u32,
        file: Arc<dyn VirtualFile>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        let file_size = file.file_size() as u32;
        VirtualMedia {
            name: name.into(),
            file_id,
            block_size,
            read_only: false,
            file,
            registry,
            info_start: AtomicI64::new(0),
            info_end: AtomicI64::new(0),
            writer: Mutex::new(WriteState {
                chunk: PacketChunk::first(),
                file_size,
            }),
            reader: Mutex::new(ReadState {
                scanner: ChunkScanner::new(block_size),
                chunk: None,
                frame_idx: 0,
            }),
        }
    }

    /// Read-only session over an existing virtual file. Recovers the
    /// file-level time range from the storage side channel; a missing or
    /// malformed blob degrades seeking but does not fail the open.
    pub fn open_read_only(
        name: impl Into<String>,
        file_id: u32,
        block_size: u32,
        file: Arc<dyn VirtualFile>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        let info = match file.optional_data() {
            Ok(data) => match chunk::decode_info(&data) {
                Ok(info) => info,
                Err(e) => {
                    warn!("virtual media {file_id} has no usable media info ({e}), time-seek degraded");
                    MediaInfo::default()
                }
            },
            Err(e) => {
                warn!("virtual media {file_id}: reading media info failed ({e}), time-seek degraded");
                MediaInfo::default()
            }
        };
        let file_size = file.file_size() as u32;
        VirtualMedia {
            name: name.into(),
            file_id,
            block_size,
            read_only: true,
            file,
            registry,
            info_start: AtomicI64::new(info.start_time),
            info_end: AtomicI64::new(info.end_time),
            writer: Mutex::new(WriteState {
                chunk: PacketChunk::first(),
                file_size,
            }),
            reader: Mutex::new(ReadState {
                scanner: ChunkScanner::new(block_size),
                chunk: None,
                frame_idx: 0,
            }),
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current file-level time range.
    pub fn info(&self) -> MediaInfo {
        MediaInfo {
            start_time: self.info_start.load(Ordering::Relaxed),
            end_time: self.info_end.load(Ordering::Relaxed),
        }
    }

    /// Append a packet to the active chunk, flushing it first when a
    /// video key frame arrives and the chunk already holds at least
    /// [`CHUNK_MIN_FRAME_COUNT`] packets.
    ///
    /// Video packets whose time runs backwards (negative, or before the
    /// active chunk's start) are dropped with a warning and `Ok(())`;
    /// non-video packets carry no ordering obligation.
    pub fn write_frame(&self, packet: Packet) -> Result<()> {
        if self.read_only {
            return Err(MediaError::ReadOnly);
        }
        let mut w = lock(&self.writer);

        if packet.packet_type == PacketType::Video
            && packet.is_key_frame
            && w.chunk.packets.len() >= CHUNK_MIN_FRAME_COUNT
        {
            self.flush_locked(&mut w)?;
        }

        if packet.packet_type == PacketType::Video {
            if packet.time < 0 || packet.time < w.chunk.start_time {
                warn!(
                    "virtual media {}: dropping video packet with time {} before chunk start {}",
                    self.file_id, packet.time, w.chunk.start_time
                );
                return Ok(());
            }
            if w.chunk.packets.is_empty() && w.chunk.index == 1 {
                w.chunk.start_time = packet.time;
            }
            w.chunk.end_time = packet.time;
        }

        w.chunk.packets.push(packet);
        Ok(())
    }

    /// Encode and append the active chunk, persist the file-level time
    /// range, and rotate to a successor chunk linked back at the record
    /// just written. No bookkeeping is touched if the storage write
    /// fails.
    fn flush_locked(&self, w: &mut WriteState) -> Result<()> {
        let record = chunk::encode_chunk(&w.chunk);
        let written = self.file.write(&record)?;
        w.file_size += written as u32;

        if w.chunk.index == 1 {
            self.info_start.store(w.chunk.start_time, Ordering::Relaxed);
        }
        self.info_end.store(w.chunk.end_time, Ordering::Relaxed);
        self.file
            .update_optional_data(&chunk::encode_info(&self.info()))?;

        w.chunk = PacketChunk {
            index: w.chunk.index + 1,
            start_time: w.chunk.end_time,
            // Seeded equal to start so a close-flush of a chunk that never
            // saw a video packet cannot regress the file-level range.
            end_time: w.chunk.end_time,
            packets: Vec::new(),
            prev_chunk_size: record.len() as u32,
            prev_chunk_start: w.file_size - record.len() as u32,
        };
        Ok(())
    }

    /// Next packet of the flat stream, crossing chunk boundaries
    /// transparently. Packet order within a chunk is insertion order;
    /// chunk order is ascending index.
    pub fn read_frame(&self) -> Result<Packet> {
        let mut r = lock(&self.reader);
        loop {
            if let Some(c) = &r.chunk {
                if r.frame_idx < c.packets.len() {
                    let packet = c.packets[r.frame_idx].clone();
                    r.frame_idx += 1;
                    return Ok(packet);
                }
                if c.packets.is_empty() {
                    warn!(
                        "virtual media {}: chunk {} has an empty packet list",
                        self.file_id, c.index
                    );
                }
            }
            self.next_chunk_locked(&mut r)?;
        }
    }

    /// Load the next chunk from the current storage position.
    pub fn next_chunk(&self) -> Result<PacketChunk> {
        let mut r = lock(&self.reader);
        self.next_chunk_locked(&mut r)
    }

    fn next_chunk_locked(&self, r: &mut ReadState) -> Result<PacketChunk> {
        let chunk = r.scanner.next_chunk(self.file.as_ref())?;
        r.chunk = Some(chunk.clone());
        r.frame_idx = 0;
        Ok(chunk)
    }

    /// Move the read cursor to the chunk immediately before the current
    /// one, using the linkage recorded at flush time.
    ///
    /// Fails with [`MediaError::NoPreviousChunk`] at chunk index 1. With
    /// no chunk loaded yet it degrades to a forward scan, equivalent to
    /// reading the first chunk from the current position.
    pub fn previous_chunk(&self) -> Result<PacketChunk> {
        let mut r = lock(&self.reader);
        self.previous_chunk_locked(&mut r)
    }

    fn previous_chunk_locked(&self, r: &mut ReadState) -> Result<PacketChunk> {
        let Some(current) = r.chunk.clone() else {
            return self.next_chunk_locked(r);
        };
        if current.index == 1 {
            return Err(MediaError::NoPreviousChunk);
        }

        self.file
            .change_seek_pointer(current.prev_chunk_start as i64)?;
        r.scanner.clear();

        let mut record = vec![0u8; current.prev_chunk_size as usize];
        let mut filled = 0;
        while filled < record.len() {
            let n = self.file.read(&mut record[filled..])?;
            if n == 0 {
                return Err(MediaError::Truncated {
                    needed: record.len(),
                    got: filled,
                });
            }
            filled += n;
        }

        // The storage cursor now rests at the record we stepped back
        // from, so a later forward scan resumes there.
        let chunk = chunk::decode_chunk(&record)?;
        r.chunk = Some(chunk.clone());
        r.frame_idx = 0;
        Ok(chunk)
    }

    /// Position the read cursor at the chunk whose time window contains,
    /// or most closely brackets, `target`. Returns the achieved chunk's
    /// start time, generally at or below the requested time by up to one
    /// chunk's span.
    ///
    /// The jump offset is approximated from the file-level time range and
    /// biased `2 × block_size` early, since forward correction is cheaper
    /// than backward correction. The correction loop makes strict
    /// progress in one direction; a direction reversal means the target
    /// falls in a gap between adjacent windows and the nearest bracketing
    /// chunk wins. Exhausting the stream in either direction yields
    /// [`MediaError::TimeNotFound`].
    pub fn goto_time(&self, target: i64) -> Result<i64> {
        let mut r = lock(&self.reader);

        // Fast path: the loaded chunk already covers the target.
        if let Some(c) = &r.chunk {
            if c.covers(target) {
                let start = c.start_time;
                r.frame_idx = 0;
                return Ok(start);
            }
        }

        let info = self.info();
        let duration = info.end_time - info.start_time;
        let mut offset = 0i64;
        let file_size = self.file.file_size();
        if duration != 0 {
            // Clamped: a target past the recorded range must still land
            // inside the file so the correction loop can diagnose it.
            offset = (target.saturating_mul(file_size) / duration).min(file_size);
        } else {
            warn!(
                "virtual media {}: file time range is empty (start {}, end {}), seeking from offset 0",
                self.file_id, info.start_time, info.end_time
            );
        }
        offset = (offset - i64::from(self.block_size) * 2).max(0);

        self.file.change_seek_pointer(offset)?;
        r.scanner.clear();
        r.chunk = None;

        // A landing point inside the trailing record sits past its magic
        // marker, so the forward scan finds nothing; back off one block
        // at a time until a record completes or offset 0 proves the
        // stream empty.
        let mut chunk = loop {
            match self.next_chunk_locked(&mut r) {
                Ok(c) => break c,
                Err(MediaError::EndOfStream) if offset > 0 => {
                    offset = (offset - i64::from(self.block_size)).max(0);
                    self.file.change_seek_pointer(offset)?;
                    r.scanner.clear();
                }
                Err(e) => return Err(e),
            }
        };
        let mut stepped_forward = false;
        let mut stepped_backward = false;
        loop {
            if chunk.covers(target) {
                return Ok(chunk.start_time);
            }
            if chunk.end_time < target {
                if stepped_backward {
                    // Gap between adjacent windows; this chunk is the
                    // nearest bracket from below.
                    return Ok(chunk.start_time);
                }
                stepped_forward = true;
                chunk = match self.next_chunk_locked(&mut r) {
                    Ok(c) => c,
                    Err(MediaError::EndOfStream) => return Err(MediaError::TimeNotFound(target)),
                    Err(e) => return Err(e),
                };
            } else {
                if stepped_forward {
                    return Ok(chunk.start_time);
                }
                stepped_backward = true;
                chunk = match self.previous_chunk_locked(&mut r) {
                    Ok(c) => c,
                    Err(MediaError::NoPreviousChunk) => return Err(MediaError::TimeNotFound(target)),
                    Err(e) => return Err(e),
                };
            }
        }
    }

    /// Close the session, flushing any remaining buffered packets (even
    /// below the minimum frame count) unless read-only, and notify the
    /// registry. Use exactly one close variant per shutdown path.
    pub fn close(&self) -> Result<()> {
        self.shutdown(true)
    }

    /// Close without the registry notification. Used by the registry's
    /// own shutdown and deletion paths, which already hold their lock.
    pub fn close_without_notify(&self) -> Result<()> {
        self.shutdown(false)
    }

    fn shutdown(&self, notify: bool) -> Result<()> {
        let mut w = lock(&self.writer);
        let mut r = lock(&self.reader);

        if !w.chunk.packets.is_empty() && !self.read_only {
            self.flush_locked(&mut w)?;
        }

        if let Err(e) = self.file.close() {
            error!("virtual media {}: storage close failed: {e}", self.file_id);
        }

        r.scanner.clear();
        r.chunk = None;
        r.frame_idx = 0;
        w.chunk.packets.clear();

        if notify {
            self.registry.closed(self.file_id)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFile;
    use std::sync::atomic::AtomicUsize;

    struct NullRegistry {
        closed_count: AtomicUsize,
    }

    impl NullRegistry {
        fn new() -> Arc<Self> {
            Arc::new(NullRegistry {
                closed_count: AtomicUsize::new(0),
            })
        }
    }

    impl Registry for NullRegistry {
        fn closed(&self, _file_id: u32) -> Result<()> {
            self.closed_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn file_deleted(&self, _file_id: u32, _reason: &str) {}
    }

    fn video_key(time: i64, data: Vec<u8>) -> Packet {
        Packet {
            data,
            packet_type: PacketType::Video,
            is_key_frame: true,
            time,
        }
    }

    fn scan_all(file: &MemFile) -> Vec<PacketChunk> {
        let mut scanner = ChunkScanner::new(128);
        let mut chunks = Vec::new();
        while let Ok(c) = scanner.next_chunk(file) {
            chunks.push(c);
        }
        chunks
    }

    #[test]
    fn test_write_read_fidelity() {
        let file = Arc::new(MemFile::new());
        let registry = NullRegistry::new();
        let vm = VirtualMedia::new("fidelity", 1, 64, file.clone(), registry.clone());

        let packets: Vec<Packet> = (0..20)
            .map(|i| video_key(i * 30, vec![i as u8; 10 + i as usize]))
            .collect();
        for p in &packets {
            vm.write_frame(p.clone()).unwrap();
        }
        vm.close().unwrap();
        assert_eq!(registry.closed_count.load(Ordering::Relaxed), 1);

        let vm2 = VirtualMedia::open_read_only("fidelity", 1, 64, file, registry);
        for expected in &packets {
            let got = vm2.read_frame().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(matches!(vm2.read_frame(), Err(MediaError::EndOfStream)));
    }

    #[test]
    fn test_flush_boundary_and_monotonic_index() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::new("boundary", 2, 64, file.clone(), NullRegistry::new());

        for i in 0..12 {
            vm.write_frame(video_key(i * 30, vec![0xab; 8])).unwrap();
        }
        vm.close().unwrap();

        let chunks = scan_all(&file);
        assert_eq!(chunks.len(), 3);
        // A key frame flushes only once the minimum is reached; the final
        // chunk flushed at close may fall below it.
        assert_eq!(chunks[0].packets.len(), 5);
        assert_eq!(chunks[1].packets.len(), 5);
        assert_eq!(chunks[2].packets.len(), 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u32 + 1);
        }
        // Rotation chains the time windows.
        assert_eq!(chunks[0].end_time, chunks[1].start_time);
        assert_eq!(chunks[1].end_time, chunks[2].start_time);
    }

    #[test]
    fn test_chunk_linkage_points_at_previous_record() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::new("linkage", 3, 64, file.clone(), NullRegistry::new());
        for i in 0..11 {
            vm.write_frame(video_key(i * 30, vec![i as u8; 4])).unwrap();
        }
        vm.close().unwrap();

        let chunks = scan_all(&file);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].prev_chunk_size, 0);
        let contents = file.contents();
        let first_len = chunks[1].prev_chunk_size as usize;
        assert_eq!(chunks[1].prev_chunk_start, 0);
        // The linked span decodes back to the first chunk.
        assert_eq!(
            chunk::decode_chunk(&contents[..first_len]).unwrap(),
            chunks[0]
        );
        assert_eq!(chunks[2].prev_chunk_start as usize, first_len);
    }

    #[test]
    fn test_out_of_order_video_time_dropped() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::new("order", 4, 64, file.clone(), NullRegistry::new());

        vm.write_frame(video_key(-1, vec![1])).unwrap();
        vm.write_frame(video_key(300, vec![2])).unwrap();
        vm.write_frame(video_key(200, vec![3])).unwrap();
        vm.close().unwrap();

        let chunks = scan_all(&file);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].packets.len(), 1);
        assert_eq!(chunks[0].packets[0].data, vec![2]);
    }

    #[test]
    fn test_non_video_packets_skip_time_check() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::new("audio", 5, 64, file.clone(), NullRegistry::new());

        vm.write_frame(video_key(100, vec![1])).unwrap();
        vm.write_frame(Packet {
            data: vec![2],
            packet_type: PacketType::Audio,
            is_key_frame: false,
            time: -50,
        })
        .unwrap();
        vm.close().unwrap();

        let chunks = scan_all(&file);
        assert_eq!(chunks[0].packets.len(), 2);
        // Audio does not move the chunk's time window.
        assert_eq!(chunks[0].start_time, 100);
        assert_eq!(chunks[0].end_time, 100);
    }

    #[test]
    fn test_read_only_write_rejected() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::open_read_only("ro", 6, 64, file.clone(), NullRegistry::new());
        assert!(matches!(
            vm.write_frame(video_key(0, vec![1])),
            Err(MediaError::ReadOnly)
        ));
        assert_eq!(file.file_size(), 0);
        vm.close().unwrap();
        assert_eq!(file.file_size(), 0);
    }

    #[test]
    fn test_media_info_persisted_per_flush() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::new("info", 7, 64, file.clone(), NullRegistry::new());

        for i in 0..6 {
            vm.write_frame(video_key(i * 30, vec![0; 4])).unwrap();
        }
        // Sixth key frame flushed the first five packets.
        let info = chunk::decode_info(&file.optional_data().unwrap()).unwrap();
        assert_eq!(info.start_time, 0);
        assert_eq!(info.end_time, 120);

        vm.close().unwrap();
        let info = chunk::decode_info(&file.optional_data().unwrap()).unwrap();
        assert_eq!(info.end_time, 150);
    }

    #[test]
    fn test_previous_chunk_without_loaded_chunk_scans_forward() {
        let file = Arc::new(MemFile::new());
        let vm = VirtualMedia::new("degrade", 8, 64, file.clone(), NullRegistry::new());
        for i in 0..6 {
            vm.write_frame(video_key(i * 30, vec![0; 4])).unwrap();
        }
        vm.close().unwrap();

        let vm2 = VirtualMedia::open_read_only("degrade", 8, 64, file, NullRegistry::new());
        let first = vm2.previous_chunk().unwrap();
        assert_eq!(first.index, 1);
        // Now a real backward step from the first chunk must fail.
        assert!(matches!(
            vm2.previous_chunk(),
            Err(MediaError::NoPreviousChunk)
        ));
    }

    struct FlakyFile {
        inner: MemFile,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl FlakyFile {
        fn new() -> Self {
            FlakyFile {
                inner: MemFile::new(),
                fail_writes: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl crate::storage::VirtualFile for FlakyFile {
        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            self.inner.read(buf)
        }

        fn change_seek_pointer(&self, offset: i64) -> Result<()> {
            self.inner.change_seek_pointer(offset)
        }

        fn write(&self, data: &[u8]) -> Result<usize> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(MediaError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write(data)
        }

        fn file_size(&self) -> i64 {
            self.inner.file_size()
        }

        fn update_optional_data(&self, data: &[u8]) -> Result<()> {
            self.inner.update_optional_data(data)
        }

        fn optional_data(&self) -> Result<Vec<u8>> {
            self.inner.optional_data()
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_failed_flush_leaves_bookkeeping_unchanged() {
        let file = Arc::new(FlakyFile::new());
        let vm = VirtualMedia::new("flaky", 10, 64, file.clone(), NullRegistry::new());

        for i in 0..5 {
            vm.write_frame(video_key(i * 30, vec![0; 4])).unwrap();
        }

        // The sixth key frame triggers a flush that fails at the storage
        // layer; no bytes land and the chunk must not rotate.
        file.fail_writes.store(true, Ordering::Relaxed);
        assert!(vm.write_frame(video_key(150, vec![0; 4])).is_err());
        assert_eq!(file.file_size(), 0);

        // Once storage recovers, the retried write flushes chunk 1 as if
        // the failure never happened.
        file.fail_writes.store(false, Ordering::Relaxed);
        vm.write_frame(video_key(150, vec![0; 4])).unwrap();
        vm.close().unwrap();

        let mut scanner = ChunkScanner::new(128);
        let first = scanner.next_chunk(file.as_ref()).unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.packets.len(), 5);
        let second = scanner.next_chunk(file.as_ref()).unwrap();
        assert_eq!(second.index, 2);
        assert_eq!(second.packets[0].time, 150);
    }

    #[test]
    fn test_close_without_notify_skips_registry() {
        let file = Arc::new(MemFile::new());
        let registry = NullRegistry::new();
        let vm = VirtualMedia::new("quiet", 9, 64, file, registry.clone());
        vm.write_frame(video_key(0, vec![1])).unwrap();
        vm.close_without_notify().unwrap();
        assert_eq!(registry.closed_count.load(Ordering::Relaxed), 0);
    }
}

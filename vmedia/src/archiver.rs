use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::{MediaError, Result};
use crate::session::VirtualMedia;
use crate::storage::{FileSystem, lock};

/// Notifications the surrounding system receives from the registry.
pub trait Events: Send + Sync {
    /// A virtual media file was reclaimed out-of-band (e.g. storage
    /// pressure) while the registry was responsible for it.
    fn media_file_deleted(&self, file_id: u32, reason: &str);
}

/// Registry surface consumed by sessions.
pub trait Registry: Send + Sync {
    /// A session finished a full close.
    fn closed(&self, file_id: u32) -> Result<()>;

    /// A virtual file disappeared underneath its session.
    fn file_deleted(&self, file_id: u32, reason: &str);
}

struct ArchiverInner {
    fs: Box<dyn FileSystem>,
    events: Box<dyn Events>,
    // One coarse lock over the whole table; create/open/close are cold
    // paths.
    open_files: Mutex<HashMap<u32, Arc<VirtualMedia>>>,
}

/// Open-file registry: maps file IDs to live sessions and prevents
/// duplicate concurrent opens of the same ID.
pub struct Archiver {
    inner: Arc<ArchiverInner>,
}

impl Archiver {
    pub fn new(fs: impl FileSystem + 'static, events: impl Events + 'static) -> Self {
        Archiver {
            inner: Arc::new(ArchiverInner {
                fs: Box::new(fs),
                events: Box::new(events),
                open_files: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a new virtual media file and return its writable session.
    pub fn new_virtual_media_file(&self, file_id: u32, name: &str) -> Result<Arc<VirtualMedia>> {
        let mut open = lock(&self.inner.open_files);
        if open.contains_key(&file_id) {
            return Err(MediaError::AlreadyOpen(file_id));
        }
        let file = self.inner.fs.new_virtual_file(file_id, name)?;
        let vm = Arc::new(VirtualMedia::new(
            name,
            file_id,
            self.inner.fs.block_size(),
            file,
            self.inner.clone() as Arc<dyn Registry>,
        ));
        open.insert(file_id, vm.clone());
        Ok(vm)
    }

    /// Open an existing virtual media file read-only.
    pub fn open_virtual_media_file(&self, file_id: u32) -> Result<Arc<VirtualMedia>> {
        let mut open = lock(&self.inner.open_files);
        if open.contains_key(&file_id) {
            return Err(MediaError::AlreadyOpen(file_id));
        }
        let file = self.inner.fs.open_virtual_file(file_id)?;
        let vm = Arc::new(VirtualMedia::open_read_only(
            format!("vf-{file_id}"),
            file_id,
            self.inner.fs.block_size(),
            file,
            self.inner.clone() as Arc<dyn Registry>,
        ));
        open.insert(file_id, vm.clone());
        Ok(vm)
    }

    /// Entry point for out-of-band reclamation notifications from the
    /// storage layer.
    pub fn file_deleted(&self, file_id: u32, reason: &str) {
        self.inner.file_deleted(file_id, reason);
    }

    /// Close every open session, then the underlying filesystem.
    pub fn close(&self) -> Result<()> {
        // Drain under the lock, close outside it: sessions closed here
        // must not notify back into the table.
        let sessions: Vec<Arc<VirtualMedia>> =
            lock(&self.inner.open_files).drain().map(|(_, vm)| vm).collect();
        for vm in sessions {
            if let Err(e) = vm.close_without_notify() {
                warn!("closing virtual media {} failed: {e}", vm.file_id());
            }
        }
        self.inner.fs.close()
    }
}

impl Registry for ArchiverInner {
    fn closed(&self, file_id: u32) -> Result<()> {
        lock(&self.open_files).remove(&file_id);
        Ok(())
    }

    fn file_deleted(&self, file_id: u32, reason: &str) {
        let session = lock(&self.open_files).remove(&file_id);
        if let Some(vm) = session {
            if let Err(e) = vm.close_without_notify() {
                warn!("virtual media {file_id}: close after deletion failed: {e}");
            }
        }
        self.events.media_file_deleted(file_id, reason);
    }
}

//! Asynchronous file handle
//!
//! An [`AsyncFile`] is opened against a service and routes every
//! asynchronous read or write through it. The handle owns the request
//! memory; the service only drives completions. On Windows the underlying
//! handle is opened overlapped and bound to the service's completion port
//! at open time; on POSIX the association is purely logical.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::request::{IoRequest, OpKind, RequestState, Transfer};
use crate::service::IoService;

#[cfg(windows)]
const FILE_FLAG_OVERLAPPED: u32 = 0x4000_0000;

/// How to open a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading
    Read,
    /// Open an existing file for reading and writing
    ReadWrite,
    /// Open for reading and writing, creating the file if missing
    Create,
    /// Open for reading and writing, creating or truncating
    CreateTruncate,
}

/// A regular file attached to an [`IoService`].
///
/// The borrow on the service keeps the service at a stable address for as
/// long as the handle (and any request it spawns) is alive.
pub struct AsyncFile<'s> {
    service: &'s IoService,
    file: Arc<File>,
    path: PathBuf,
}

impl<'s> AsyncFile<'s> {
    /// Opens `path` and attaches the handle to `service`.
    ///
    /// # Errors
    ///
    /// Any error the platform open (or, on Windows, the completion-port
    /// association) reports.
    pub fn open(service: &'s IoService, path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::ReadWrite => {
                opts.read(true).write(true);
            }
            OpenMode::Create => {
                opts.read(true).write(true).create(true);
            }
            OpenMode::CreateTruncate => {
                opts.read(true).write(true).create(true).truncate(true);
            }
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            opts.custom_flags(FILE_FLAG_OVERLAPPED);
        }
        let file = opts.open(&path)?;
        service.attach_file(&file)?;

        tracing::debug!(path = %path.display(), ?mode, "opened async file");
        Ok(Self {
            service,
            file: Arc::new(file),
            path,
        })
    }

    /// The path this handle was opened on
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The service this handle is attached to
    #[must_use]
    pub fn service(&self) -> &'s IoService {
        self.service
    }

    /// Current maximum extent of the file.
    ///
    /// # Errors
    ///
    /// Any error the platform stat call reports.
    pub fn length(&self) -> Result<u64> {
        #[cfg(unix)]
        {
            let st = rustix::fs::fstat(&*self.file).map_err(std::io::Error::from)?;
            #[allow(clippy::cast_sign_loss)]
            let len = st.st_size as u64;
            Ok(len)
        }
        #[cfg(windows)]
        {
            Ok(self.file.metadata()?.len())
        }
    }

    /// Resizes the file to `new_len` bytes, returning the new extent.
    ///
    /// # Errors
    ///
    /// Any error the platform truncate call reports.
    pub fn truncate(&self, new_len: u64) -> Result<u64> {
        #[cfg(unix)]
        rustix::fs::ftruncate(&*self.file, new_len).map_err(std::io::Error::from)?;
        #[cfg(windows)]
        self.file.set_len(new_len)?;
        Ok(new_len)
    }

    /// Submits a scatter read starting at `offset`.
    ///
    /// Each buffer becomes one kernel sub-operation, reading consecutive
    /// extents. `hook` runs exactly once on the owning thread when the
    /// last sub-operation is in, receiving the buffers back along with
    /// per-buffer byte counts.
    ///
    /// # Errors
    ///
    /// [`FmuxError::WrongThread`](crate::FmuxError::WrongThread) off the
    /// owning thread, an I/O error for an empty scatter list, or whatever
    /// the kernel submission reports.
    pub fn begin_read<F>(&self, offset: u64, buffers: Vec<Vec<u8>>, hook: F) -> Result<IoRequest<'s>>
    where
        F: FnOnce(Result<Transfer>) + 'static,
    {
        self.begin_io(OpKind::Read, offset, buffers, Box::new(hook))
    }

    /// Submits a gather write starting at `offset`.
    ///
    /// The gather list is handed back through `hook` once written.
    ///
    /// # Errors
    ///
    /// Same conditions as [`AsyncFile::begin_read`].
    pub fn begin_write<F>(
        &self,
        offset: u64,
        buffers: Vec<Vec<u8>>,
        hook: F,
    ) -> Result<IoRequest<'s>>
    where
        F: FnOnce(Result<Transfer>) + 'static,
    {
        self.begin_io(OpKind::Write, offset, buffers, Box::new(hook))
    }

    fn begin_io(
        &self,
        op: OpKind,
        offset: u64,
        buffers: Vec<Vec<u8>>,
        hook: Box<dyn FnOnce(Result<Transfer>)>,
    ) -> Result<IoRequest<'s>> {
        if buffers.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty scatter/gather list",
            )
            .into());
        }
        let state = RequestState::new(Arc::clone(&self.file), op, offset, buffers, hook);
        self.service.submit(&state)?;
        Ok(IoRequest::new(self.service, state))
    }
}

impl std::fmt::Debug for AsyncFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

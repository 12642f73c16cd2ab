#![forbid(unsafe_code)]

use std::{fs::File, io, path::Path, sync::Arc};

use tracing::trace;

use crate::primitives::bytes::BufferSlice;
use crate::primitives::cache::PageLoader;
use crate::types::{CacheError, Result};

/// Positioned reads from a page file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` with the bytes at `off`; fails with `UnexpectedEof` if the file is too short.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }
}

/// Read-only file access over a shared `File` handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens an existing file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(&self.inner, off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(&self.inner, off, dst)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(CacheError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }
}

impl std::fmt::Debug for StdFileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdFileIo").finish_non_exhaustive()
    }
}

/// Page loader reading from a [`FileIo`].
///
/// Pages that extend past the end of the file come back zero-filled beyond
/// the last stored byte, so freshly allocated pages load as zeroes.
#[derive(Clone, Debug)]
pub struct FileLoader<F> {
    io: F,
}

impl<F: FileIo> FileLoader<F> {
    /// Wraps `io`.
    pub fn new(io: F) -> Self {
        Self { io }
    }

    /// The underlying file.
    pub fn io(&self) -> &F {
        &self.io
    }
}

impl FileLoader<StdFileIo> {
    /// Opens `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(StdFileIo::open(path)?))
    }
}

impl<F: FileIo> PageLoader for FileLoader<F> {
    fn load(&self, position: u64, target: &mut BufferSlice) -> Result<()> {
        let file_len = self.io.len()?;
        let dst = target.as_mut_slice();
        let available = file_len
            .saturating_sub(position)
            .min(dst.len() as u64) as usize;
        if available > 0 {
            self.io.read_at(position, &mut dst[..available])?;
        }
        if available < dst.len() {
            trace!(position, available, len = dst.len(), "cache.io.short_page");
            dst[available..].fill(0);
        }
        Ok(())
    }
}

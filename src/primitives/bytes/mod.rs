#![forbid(unsafe_code)]
//! Byte-level helpers and the owned buffer slice that backs one cached page.

pub mod le {
    //! Little-endian fixed-width accessors over raw byte slices.
    //!
    //! These return `None` when the requested window does not fit so callers
    //! can map the failure into their own error type.

    use core::convert::TryInto;

    /// Reads a little-endian u16 at `off`.
    pub fn get_u16(src: &[u8], off: usize) -> Option<u16> {
        let bytes: [u8; 2] = window(src, off, 2)?.try_into().ok()?;
        Some(u16::from_le_bytes(bytes))
    }

    /// Reads a little-endian u32 at `off`.
    pub fn get_u32(src: &[u8], off: usize) -> Option<u32> {
        let bytes: [u8; 4] = window(src, off, 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Reads a little-endian u64 at `off`.
    pub fn get_u64(src: &[u8], off: usize) -> Option<u64> {
        let bytes: [u8; 8] = window(src, off, 8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Writes `bytes` at `off`, returning `None` if they do not fit.
    pub fn put(dst: &mut [u8], off: usize, bytes: &[u8]) -> Option<()> {
        let end = off.checked_add(bytes.len())?;
        dst.get_mut(off..end)?.copy_from_slice(bytes);
        Some(())
    }

    fn window(src: &[u8], off: usize, len: usize) -> Option<&[u8]> {
        let end = off.checked_add(len)?;
        src.get(off..end)
    }
}

pub mod slice {
    //! Fixed-length byte span owned by exactly one page buffer.

    use core::fmt;

    use super::le;
    use crate::types::{CacheError, Result};

    const OUT_OF_RANGE: CacheError = CacheError::InvalidState("buffer slice access out of range");

    /// An owned, fixed-capacity byte region exposing a `[offset, offset + len)` window.
    ///
    /// The backing allocation is sized to a cache size class; the visible window is
    /// the page's required size, which may be smaller than the class.
    pub struct BufferSlice {
        array: Box<[u8]>,
        offset: usize,
        count: usize,
    }

    impl BufferSlice {
        /// Allocates a zeroed slice whose window spans the whole capacity.
        pub fn new(capacity: usize) -> Self {
            Self {
                array: vec![0u8; capacity].into_boxed_slice(),
                offset: 0,
                count: capacity,
            }
        }

        /// Allocates a zeroed slice of `capacity` bytes exposing `count` bytes from `offset`.
        pub fn with_window(capacity: usize, offset: usize, count: usize) -> Result<Self> {
            let mut slice = Self::new(capacity);
            slice.set_window(offset, count)?;
            Ok(slice)
        }

        pub(crate) fn set_window(&mut self, offset: usize, count: usize) -> Result<()> {
            let end = offset.checked_add(count).ok_or(OUT_OF_RANGE)?;
            if end > self.array.len() {
                return Err(OUT_OF_RANGE);
            }
            self.offset = offset;
            self.count = count;
            Ok(())
        }

        /// Start of the window inside the backing allocation.
        pub fn offset(&self) -> usize {
            self.offset
        }

        /// Number of visible bytes.
        pub fn len(&self) -> usize {
            self.count
        }

        /// Returns true when the window is empty.
        pub fn is_empty(&self) -> bool {
            self.count == 0
        }

        /// Size of the backing allocation.
        pub fn capacity(&self) -> usize {
            self.array.len()
        }

        /// Visible bytes.
        pub fn as_slice(&self) -> &[u8] {
            &self.array[self.offset..self.offset + self.count]
        }

        /// Visible bytes, mutably.
        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            &mut self.array[self.offset..self.offset + self.count]
        }

        /// Sets every visible byte to `value`.
        pub fn fill(&mut self, value: u8) {
            self.as_mut_slice().fill(value);
        }

        /// Zeroes the entire backing allocation, not just the window.
        pub fn clear(&mut self) {
            self.array.fill(0);
        }

        /// Copies `src` into the window starting at `off`.
        pub fn write_bytes(&mut self, off: usize, src: &[u8]) -> Result<()> {
            le::put(self.as_mut_slice(), off, src).ok_or(OUT_OF_RANGE)
        }

        /// Returns a byte at `off`.
        pub fn read_u8(&self, off: usize) -> Result<u8> {
            self.as_slice().get(off).copied().ok_or(OUT_OF_RANGE)
        }

        /// Reads a little-endian u16 at `off`.
        pub fn read_u16(&self, off: usize) -> Result<u16> {
            le::get_u16(self.as_slice(), off).ok_or(OUT_OF_RANGE)
        }

        /// Reads a little-endian u32 at `off`.
        pub fn read_u32(&self, off: usize) -> Result<u32> {
            le::get_u32(self.as_slice(), off).ok_or(OUT_OF_RANGE)
        }

        /// Reads a little-endian i32 at `off`.
        pub fn read_i32(&self, off: usize) -> Result<i32> {
            self.read_u32(off).map(|v| v as i32)
        }

        /// Reads a little-endian u64 at `off`.
        pub fn read_u64(&self, off: usize) -> Result<u64> {
            le::get_u64(self.as_slice(), off).ok_or(OUT_OF_RANGE)
        }

        /// Writes a byte at `off`.
        pub fn write_u8(&mut self, off: usize, value: u8) -> Result<()> {
            self.write_bytes(off, &[value])
        }

        /// Writes a little-endian u16 at `off`.
        pub fn write_u16(&mut self, off: usize, value: u16) -> Result<()> {
            self.write_bytes(off, &value.to_le_bytes())
        }

        /// Writes a little-endian u32 at `off`.
        pub fn write_u32(&mut self, off: usize, value: u32) -> Result<()> {
            self.write_bytes(off, &value.to_le_bytes())
        }

        /// Writes a little-endian i32 at `off`.
        pub fn write_i32(&mut self, off: usize, value: i32) -> Result<()> {
            self.write_bytes(off, &value.to_le_bytes())
        }

        /// Writes a little-endian u64 at `off`.
        pub fn write_u64(&mut self, off: usize, value: u64) -> Result<()> {
            self.write_bytes(off, &value.to_le_bytes())
        }
    }

    impl fmt::Debug for BufferSlice {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("BufferSlice")
                .field("offset", &self.offset)
                .field("len", &self.count)
                .field("capacity", &self.array.len())
                .finish()
        }
    }
}

pub use slice::BufferSlice;

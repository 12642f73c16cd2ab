//! Low-level primitives the page cache is built from.

/// Byte-level utilities and the windowed buffer slice.
pub mod bytes;

/// Page buffer cache: live set, free pool and idle cleanup.
pub mod cache;

/// File access and the file-backed page loader.
pub mod io;

//! Aligned block I/O
//!
//! Owns the file descriptor for a raw block device or a regular file standing
//! in for one. Two modes:
//!
//! - **Buffered**: positioned reads/writes at arbitrary offsets.
//! - **Direct** (`O_DIRECT`): the kernel page cache is bypassed, so every
//!   buffer, offset, and length must be a multiple of the device block size.
//!   Partial-block accesses go through a block-aligned scratch buffer with
//!   read-modify-write on the write path.
//!
//! Block devices are sized via the `BLKGETSIZE64`/`BLKSSZGET` ioctls; regular
//! files via `stat`, with a 512-byte default block size and a 100 MiB initial
//! extent for newly created files.
//!
//! A short transfer (bytes moved ≠ bytes requested) is an error; there is no
//! retry loop.

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::NonNull;

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// Default block size for regular files (also the O_DIRECT alignment floor)
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Initial extent for newly created backing files
pub const MIN_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// How the device was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Buffered,
    Direct,
}

/// Round `value` down to a multiple of `block`
#[inline(always)]
pub(crate) fn align_down(value: u64, block: u64) -> u64 {
    value / block * block
}

/// Round `value` up to a multiple of `block`
#[inline(always)]
pub(crate) fn align_up(value: u64, block: u64) -> u64 {
    value.div_ceil(block) * block
}

// ============================================================================
// Aligned scratch buffer
// ============================================================================

/// Heap buffer aligned to the device block size, for O_DIRECT transfers.
///
/// Allocated zeroed and freed when dropped; one buffer lives per I/O call,
/// no pooling.
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn zeroed(len: usize, align: usize) -> Result<Self> {
        // O_DIRECT requires at least sector alignment
        let align = align.max(DEFAULT_BLOCK_SIZE as usize);
        let layout = Layout::from_size_align(len, align)
            .map_err(|e| StoreError::InvalidArgument(format!("bad buffer layout: {e}")))?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("aligned allocation of {len} bytes failed"),
            ))
        })?;
        Ok(Self { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// ============================================================================
// Block device
// ============================================================================

/// An open block device or backing file with positioned, alignment-aware I/O
pub struct BlockDevice {
    file: File,
    size: u64,
    block_size: u32,
    mode: IoMode,
}

impl BlockDevice {
    /// Open `path`, preferring O_DIRECT when `direct` is set.
    ///
    /// A failed O_DIRECT open logs the downgrade and falls back to buffered
    /// mode (some filesystems refuse the flag). Regular files that do not
    /// exist are created, except under `/dev`.
    pub fn open(path: &Path, direct: bool) -> Result<Self> {
        if direct {
            match Self::open_with_mode(path, IoMode::Direct) {
                Ok(dev) => return Ok(dev),
                Err(err) => {
                    warn!(
                        "O_DIRECT open of {} failed ({}), falling back to buffered I/O",
                        path.display(),
                        err
                    );
                }
            }
        }
        Self::open_with_mode(path, IoMode::Buffered)
    }

    fn open_with_mode(path: &Path, mode: IoMode) -> Result<Self> {
        let is_dev_path = path.starts_with("/dev");

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_dev_path {
            // Block-device nodes are never created by the engine
            options.create(true);
        }
        #[cfg(target_os = "linux")]
        if mode == IoMode::Direct {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        if mode == IoMode::Direct {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "O_DIRECT is only supported on Linux",
            )));
        }

        let file = options.open(path)?;
        let metadata = file.metadata()?;

        let (size, block_size) = if is_block_device(&metadata) {
            block_device_geometry(&file)?
        } else {
            let mut size = metadata.len();
            if size == 0 {
                // Fresh backing file: give the layout room to breathe
                info!(
                    "initializing new backing file {} with {} bytes",
                    path.display(),
                    MIN_FILE_SIZE
                );
                file.set_len(MIN_FILE_SIZE)?;
                size = MIN_FILE_SIZE;
            }
            (size, DEFAULT_BLOCK_SIZE)
        };

        debug!(
            "opened {} ({:?}): {} bytes, block size {}",
            path.display(),
            mode,
            size,
            block_size
        );

        Ok(Self {
            file,
            size,
            block_size,
            mode,
        })
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Logical block size in bytes
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Mode the device actually opened with (records a direct→buffered downgrade)
    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// Positioned read of `buf.len()` bytes at `offset`
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.mode {
            IoMode::Buffered => {
                let n = self.file.read_at(buf, offset)?;
                if n != buf.len() {
                    return Err(StoreError::short_read(buf.len(), n, offset));
                }
                Ok(())
            }
            IoMode::Direct => self.read_at_direct(buf, offset),
        }
    }

    /// Positioned write of `buf.len()` bytes at `offset`
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.mode {
            IoMode::Buffered => {
                let n = self.file.write_at(buf, offset)?;
                if n != buf.len() {
                    return Err(StoreError::short_write(buf.len(), n, offset));
                }
                Ok(())
            }
            IoMode::Direct => self.write_at_direct(buf, offset),
        }
    }

    fn read_at_direct(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let block = self.block_size as u64;
        let aligned_offset = align_down(offset, block);
        let delta = (offset - aligned_offset) as usize;
        let aligned_len = align_up((buf.len() + delta) as u64, block) as usize;

        let mut scratch = AlignedBuf::zeroed(aligned_len, self.block_size as usize)?;

        let n = self.file.read_at(scratch.as_mut_slice(), aligned_offset)?;
        if n != aligned_len {
            return Err(StoreError::short_read(aligned_len, n, aligned_offset));
        }

        buf.copy_from_slice(&scratch.as_slice()[delta..delta + buf.len()]);
        Ok(())
    }

    fn write_at_direct(&self, buf: &[u8], offset: u64) -> Result<()> {
        let block = self.block_size as u64;
        let aligned_offset = align_down(offset, block);
        let delta = (offset - aligned_offset) as usize;
        let aligned_len = align_up((buf.len() + delta) as u64, block) as usize;

        let mut scratch = AlignedBuf::zeroed(aligned_len, self.block_size as usize)?;

        // Partial blocks keep their surrounding bytes: read-modify-write.
        // A short pre-read is fine (tail of a fresh extent reads back zeros).
        if delta > 0 || buf.len() % block as usize != 0 {
            self.file.read_at(scratch.as_mut_slice(), aligned_offset)?;
        }

        scratch.as_mut_slice()[delta..delta + buf.len()].copy_from_slice(buf);

        let n = self.file.write_at(scratch.as_slice(), aligned_offset)?;
        if n != aligned_len {
            return Err(StoreError::short_write(aligned_len, n, aligned_offset));
        }
        Ok(())
    }
}

fn is_block_device(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_block_device()
}

/// Query (size, logical block size) for a block device fd
#[cfg(target_os = "linux")]
fn block_device_geometry(file: &File) -> Result<(u64, u32)> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();

    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    if unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size) } != 0 {
        return Err(StoreError::Io(std::io::Error::last_os_error()));
    }

    let mut block: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, libc::BLKSSZGET as _, &mut block) } != 0 {
        return Err(StoreError::Io(std::io::Error::last_os_error()));
    }

    Ok((size, block as u32))
}

#[cfg(not(target_os = "linux"))]
fn block_device_geometry(_file: &File) -> Result<(u64, u32)> {
    Err(StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "block device geometry ioctls are only supported on Linux",
    )))
}

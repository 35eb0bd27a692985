//! Shared-memory buffer pool
//!
//! Each [`PixelBuffer`] owns one anonymous POSIX shm segment mapped read/write
//! and one server-side `wl_buffer` carved out of it at offset 0. The segment
//! name is randomized and unlinked right after opening, so the memory is only
//! reachable through the descriptor and never leaks into `/dev/shm` on a crash.
//! The descriptor itself is closed before [`ShmPool::allocate`] returns; the
//! mapping stays valid.
//!
//! Pixels are ARGB8888: one little-endian `u32` per pixel, packed `0xAARRGGBB`,
//! so the bytes in memory read B, G, R, A.

use crate::error::AllocError;
use crate::protocol::{BufferSpec, Display, ObjectId};
use log::{debug, trace};
use memmap2::MmapMut;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::cell::Cell;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::rc::Rc;

/// Bytes per ARGB8888 pixel
pub const BYTES_PER_PIXEL: u32 = 4;

/// How many random names to try before giving up on shm_open
const NAME_ATTEMPTS: usize = 16;

/// A mapped shm segment plus the `wl_buffer` wrapping it
#[derive(Debug)]
pub struct PixelBuffer {
    id: ObjectId,
    width: u32,
    height: u32,
    stride: u32,
    map: MmapMut,
    /// Attached and committed, not yet released by the server
    busy: bool,
}

impl PixelBuffer {
    /// Server-side buffer object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Size of the backing memory in bytes
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Raw pixel words in memory order
    pub fn pixels(&self) -> &[u32] {
        bytemuck::cast_slice(&self.map[..])
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        bytemuck::cast_slice_mut(&mut self.map[..])
    }

    /// Pixel at (x, y) as 0xAARRGGBB
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = (y * self.width + x) as usize;
        self.pixels().get(index).map(|p| u32::from_le(*p))
    }

    /// Fill every pixel with one 0xAARRGGBB color
    pub fn fill(&mut self, color: u32) {
        self.pixels_mut().fill(color.to_le());
    }

    /// Write pixels row by row; `shade(x, y)` returns 0xAARRGGBB
    pub fn paint(&mut self, mut shade: impl FnMut(u32, u32) -> u32) {
        let width = self.width as usize;
        for (y, row) in self.pixels_mut().chunks_exact_mut(width).enumerate() {
            for (x, pixel) in row.iter_mut().enumerate() {
                *pixel = shade(x as u32, y as u32).to_le();
            }
        }
    }

    /// Whether the server may still be reading this buffer
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Called after the buffer was attached and committed
    pub fn mark_attached(&mut self) {
        self.busy = true;
    }

    /// Called when the server sends `wl_buffer.release`
    pub fn mark_released(&mut self) {
        self.busy = false;
    }

    /// Destroy the server object, then unmap. Must not be called while the
    /// buffer is the one attached to a live surface.
    pub fn release(self, display: &mut dyn Display) {
        debug!(
            "Releasing buffer {} ({}x{}, {} bytes)",
            self.id,
            self.width,
            self.height,
            self.map.len()
        );
        display.destroy(self.id);
        drop(self.map);
    }
}

/// Allocator for [`PixelBuffer`]s backed by one bound `wl_shm`. Clones share
/// the fault counter.
#[derive(Debug, Clone)]
pub struct ShmPool {
    shm: ObjectId,
    /// Allocations left to fail with `ENOMEM`
    faults: Rc<Cell<u32>>,
}

impl ShmPool {
    pub fn new(shm: ObjectId) -> Self {
        Self {
            shm,
            faults: Rc::default(),
        }
    }

    /// Make the next `count` allocations of a valid size fail as if the
    /// system ran out of shared memory
    pub fn fail_next(&self, count: u32) {
        self.faults.set(count);
    }

    /// Allocate a `width`×`height` buffer filled with `background`
    pub fn allocate(
        &self,
        display: &mut dyn Display,
        width: u32,
        height: u32,
        background: u32,
    ) -> Result<PixelBuffer, AllocError> {
        let (stride, size) = layout(width, height)?;
        if self.faults.get() > 0 {
            self.faults.set(self.faults.get() - 1);
            return Err(AllocError::Open(io::Error::from_raw_os_error(libc::ENOMEM)));
        }

        let file = open_segment()?;
        if let Err(source) = file.set_len(size as u64) {
            // Dropping `file` closes the descriptor
            return Err(AllocError::Truncate {
                size: size as u64,
                source,
            });
        }

        // SAFETY: the segment is private to this process until it is handed to
        // the compositor below, and it is never truncated after mapping.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(AllocError::Map)?;

        let spec = BufferSpec {
            width: width as i32,
            height: height as i32,
            stride: stride as i32,
            pool_size: size as i32,
        };
        let id = display.create_buffer(self.shm, file.as_fd(), spec)?;
        drop(file);

        let mut buffer = PixelBuffer {
            id,
            width,
            height,
            stride,
            map,
            busy: false,
        };
        buffer.fill(background);
        trace!(
            "Allocated buffer {} {}x{} stride {} ({} bytes)",
            id,
            width,
            height,
            stride,
            size
        );
        Ok(buffer)
    }
}

/// Stride and total size for a buffer, both guaranteed to fit the wire's i32
fn layout(width: u32, height: u32) -> Result<(u32, u32), AllocError> {
    let invalid = || AllocError::InvalidSize { width, height };
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    let stride = width.checked_mul(BYTES_PER_PIXEL).ok_or_else(invalid)?;
    let size = stride
        .checked_mul(height)
        .filter(|size| *size <= i32::MAX as u32)
        .ok_or_else(invalid)?;
    Ok((stride, size))
}

/// Open a fresh shm segment under a random name and unlink it immediately
fn open_segment() -> Result<File, AllocError> {
    for _ in 0..NAME_ATTEMPTS {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let name = CString::new(format!("/tether-{}", suffix))
            .map_err(|e| AllocError::Open(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                continue;
            }
            return Err(AllocError::Open(err));
        }

        // SAFETY: shm_open returned a fresh descriptor owned by nobody else.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: same name as above.
        unsafe {
            libc::shm_unlink(name.as_ptr());
        }
        return Ok(File::from(owned));
    }

    Err(AllocError::NameExhausted {
        attempts: NAME_ATTEMPTS,
    })
}

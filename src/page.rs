//! Page acquisition: the only place that talks to the OS.

use std::ptr::{self, NonNull};

use libc::{MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void};

use crate::config::{ReleaseMode, UNUSED_SENTINEL};
use crate::error::{HeapError, Result};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Page size reported by `sysconf(_SC_PAGESIZE)`.
pub fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 {
    FALLBACK_PAGE_SIZE
  } else {
    size as usize
  }
}

/// A contiguous, page-aligned address range handed out by a [`PageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
  pub base: NonNull<u8>,
  pub len: usize,
}

/// Supplier of raw memory for the heap.
///
/// [`fill_sentinel`](Self::fill_sentinel) overwrites a range with a known pattern and
/// [`advise_unused`](Self::advise_unused) hands its physical pages back to the OS.
/// [`mark_unused`](Self::mark_unused) applies whichever the source is configured for.
pub trait PageSource {
  fn page_size(&self) -> usize;

  /// Maps a zero-initialized region of at least `len` bytes.
  fn acquire(
    &mut self,
    len: usize,
  ) -> Result<Region>;

  /// # Safety
  ///
  /// `region` must come from `acquire` on this source and must not be used afterwards.
  unsafe fn release(
    &mut self,
    region: Region,
  ) -> Result<()>;

  /// # Safety
  ///
  /// `start..start + len` must be page aligned and lie inside a live region.
  unsafe fn advise_unused(
    &mut self,
    start: NonNull<u8>,
    len: usize,
  ) -> Result<()>;

  /// # Safety
  ///
  /// `start..start + len` must lie inside a live region.
  unsafe fn mark_unused(
    &mut self,
    start: NonNull<u8>,
    len: usize,
  ) -> Result<()>;

  /// # Safety
  ///
  /// `start..start + len` must lie inside a live region.
  unsafe fn fill_sentinel(
    &mut self,
    start: NonNull<u8>,
    len: usize,
  ) {
    unsafe { ptr::write_bytes(start.as_ptr(), UNUSED_SENTINEL, len) };
  }
}

/// Anonymous private mappings via `mmap(2)`.
#[derive(Debug)]
pub struct MmapPageSource {
  page_size: usize,
  release: ReleaseMode,
}

impl MmapPageSource {
  pub fn new(
    page_size: usize,
    release: ReleaseMode,
  ) -> Self {
    Self { page_size, release }
  }
}

impl Default for MmapPageSource {
  fn default() -> Self {
    Self::new(os_page_size(), ReleaseMode::default())
  }
}

impl PageSource for MmapPageSource {
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn acquire(
    &mut self,
    len: usize,
  ) -> Result<Region> {
    if len == 0 {
      return Err(HeapError::OutOfMemory { requested: len });
    }

    let address = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if address == MAP_FAILED {
      return Err(HeapError::OutOfMemory { requested: len });
    }

    let base = NonNull::new(address as *mut u8).ok_or(HeapError::OutOfMemory { requested: len })?;
    Ok(Region { base, len })
  }

  unsafe fn release(
    &mut self,
    region: Region,
  ) -> Result<()> {
    let rc = unsafe { libc::munmap(region.base.as_ptr() as *mut c_void, region.len) };
    if rc < 0 {
      return Err(HeapError::last_os_error("munmap"));
    }
    Ok(())
  }

  unsafe fn advise_unused(
    &mut self,
    start: NonNull<u8>,
    len: usize,
  ) -> Result<()> {
    let rc = unsafe { libc::madvise(start.as_ptr() as *mut c_void, len, MADV_DONTNEED) };
    if rc < 0 {
      return Err(HeapError::last_os_error("madvise"));
    }
    Ok(())
  }

  unsafe fn mark_unused(
    &mut self,
    start: NonNull<u8>,
    len: usize,
  ) -> Result<()> {
    unsafe {
      match self.release {
        ReleaseMode::Sentinel => {
          self.fill_sentinel(start, len);
          Ok(())
        }
        ReleaseMode::Advise => self.advise_unused(start, len),
        ReleaseMode::SentinelThenAdvise => {
          self.fill_sentinel(start, len);
          self.advise_unused(start, len)
        }
      }
    }
  }
}

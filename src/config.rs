//! Layout constants and runtime heap configuration.

use std::mem;

use crate::block::{Block, FreeLink};
use crate::error::{HeapError, Result};
use crate::page;

/// Payload alignment. Every request is rounded up to a multiple of this.
pub const ALIGN: usize = mem::size_of::<usize>();

/// Bytes taken by a block's boundary tag.
pub const HEADER_SIZE: usize = mem::size_of::<Block>();

/// Bytes at the front of a free payload reserved for free-index bookkeeping.
pub const NODE_SIZE: usize = mem::size_of::<FreeLink>();

/// Smallest payload a free block may have. Also the smallest request served.
pub const MIN_FREE_PAYLOAD: usize = crate::align!(NODE_SIZE);

pub const DEFAULT_ARENA_PAGES: usize = 16;

/// Byte pattern written over pages handed back with [`ReleaseMode::Sentinel`].
pub const UNUSED_SENTINEL: u8 = 0x7e;

/// How the interior pages of large free blocks are handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
  /// Overwrite with [`UNUSED_SENTINEL`]. Observable, keeps the pages resident.
  #[default]
  Sentinel,
  /// `madvise(MADV_DONTNEED)`: the pages read back as zero.
  Advise,
  /// Sentinel fill followed by the advisory.
  SentinelThenAdvise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  pub page_size: usize,
  /// Minimum arena length, in pages.
  pub arena_pages: usize,
  pub release: ReleaseMode,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      page_size: page::os_page_size(),
      arena_pages: DEFAULT_ARENA_PAGES,
      release: ReleaseMode::default(),
    }
  }
}

impl HeapConfig {
  pub fn with_page_size(
    mut self,
    page_size: usize,
  ) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn with_arena_pages(
    mut self,
    arena_pages: usize,
  ) -> Self {
    self.arena_pages = arena_pages;
    self
  }

  pub fn with_release_mode(
    mut self,
    release: ReleaseMode,
  ) -> Self {
    self.release = release;
    self
  }

  pub fn arena_size(&self) -> usize {
    self.arena_pages * self.page_size
  }

  pub fn validate(&self) -> Result<()> {
    if !self.page_size.is_power_of_two() {
      return Err(HeapError::InvalidConfig("page size must be a power of two"));
    }
    if self.page_size < HEADER_SIZE + NODE_SIZE {
      return Err(HeapError::InvalidConfig("page size smaller than a block header plus free link"));
    }
    if self.arena_pages == 0 {
      return Err(HeapError::InvalidConfig("arena must span at least one page"));
    }
    if self.arena_pages.checked_mul(self.page_size).is_none() {
      return Err(HeapError::InvalidConfig("arena size overflows"));
    }
    Ok(())
  }
}

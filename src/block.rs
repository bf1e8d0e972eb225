//! Boundary-tagged blocks.
//!
//! ```text
//!   ┌────────────┬──────────────────┬────────────┬──────────────┐
//!   │ tag        │ payload (size)   │ tag        │ payload      │ ...
//!   │ size       │                  │ prev_size ─┼──► left size │
//!   │ prev_size  │                  │ flags      │              │
//!   │ flags      │                  │            │              │
//!   └────────────┴──────────────────┴────────────┴──────────────┘
//!   ▲ start_addr                    ▲ start_addr + HEADER_SIZE + size
//! ```
//!
//! Neighbours are found from the tag alone: `size` leads right, `prev_size`
//! leads left. `FIRST` and `TERMINAL` stop the walk at the arena edges.

use std::ops::Range;
use std::ptr::NonNull;

use crate::config::{HEADER_SIZE, MIN_FREE_PAYLOAD, NODE_SIZE};
use crate::error::Result;
use crate::page::PageSource;
use crate::{align_down, align_to};

const USED: usize = 1 << 0;
const FIRST: usize = 1 << 1;
const TERMINAL: usize = 1 << 2;

/// On-arena block header. Packed, so a tag may start at any byte offset.
#[repr(C, packed)]
pub struct Block {
  size: usize,
  prev_size: usize,
  flags: usize,
}

/// Free-index back reference stored at the front of a free payload.
#[repr(C, packed)]
pub struct FreeLink {
  node: usize,
  key: usize,
}

/// Snapshot of a block's boundary tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub addr: usize,
  pub size: usize,
  pub prev_size: usize,
  pub used: bool,
  pub first: bool,
  pub terminal: bool,
}

/// Pointer to a live boundary tag.
///
/// Only created over memory holding a consistent tag that outlives every use of
/// the reference; all accessors rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef(NonNull<Block>);

impl BlockRef {
  /// Writes a fresh tag at `addr`.
  ///
  /// # Safety
  ///
  /// `addr` must be valid for `HEADER_SIZE + size` bytes for as long as the
  /// returned reference is used.
  pub unsafe fn init(
    addr: NonNull<u8>,
    size: usize,
    prev_size: usize,
    first: bool,
    terminal: bool,
  ) -> Self {
    let mut flags = 0;
    if first {
      flags |= FIRST;
    }
    if terminal {
      flags |= TERMINAL;
    }

    let block = addr.cast::<Block>();
    unsafe { block.as_ptr().write(Block { size, prev_size, flags }) };
    Self(block)
  }

  /// # Safety
  ///
  /// `addr` must hold a tag written by [`BlockRef::init`] that is still live.
  pub unsafe fn at(addr: NonNull<u8>) -> Self {
    Self(addr.cast())
  }

  /// # Safety
  ///
  /// `payload` must have been produced by [`BlockRef::payload`] on a live block.
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    Self(unsafe { payload.sub(HEADER_SIZE) }.cast())
  }

  fn header(self) -> *mut Block {
    self.0.as_ptr()
  }

  pub fn start_addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
  }

  pub fn size(self) -> usize {
    unsafe { (*self.header()).size }
  }

  pub fn set_size(
    self,
    size: usize,
  ) {
    unsafe { (*self.header()).size = size };
  }

  pub fn prev_size(self) -> usize {
    unsafe { (*self.header()).prev_size }
  }

  pub fn set_prev_size(
    self,
    prev_size: usize,
  ) {
    unsafe { (*self.header()).prev_size = prev_size };
  }

  fn flag(
    self,
    flag: usize,
  ) -> bool {
    unsafe { (*self.header()).flags & flag != 0 }
  }

  fn set_flag(
    self,
    flag: usize,
    on: bool,
  ) {
    unsafe {
      let flags = (*self.header()).flags;
      (*self.header()).flags = if on { flags | flag } else { flags & !flag };
    }
  }

  pub fn is_used(self) -> bool {
    self.flag(USED)
  }

  pub fn set_used(
    self,
    used: bool,
  ) {
    self.set_flag(USED, used);
  }

  pub fn is_first(self) -> bool {
    self.flag(FIRST)
  }

  pub fn is_terminal(self) -> bool {
    self.flag(TERMINAL)
  }

  pub fn set_terminal(
    self,
    terminal: bool,
  ) {
    self.set_flag(TERMINAL, terminal);
  }

  /// Right neighbour, unless this block ends its arena.
  pub fn next(self) -> Option<BlockRef> {
    if self.is_terminal() {
      return None;
    }
    Some(Self(unsafe { self.payload().add(self.size()) }.cast()))
  }

  /// Left neighbour, unless this block starts its arena.
  pub fn prev(self) -> Option<BlockRef> {
    if self.is_first() {
      return None;
    }
    Some(Self(unsafe { self.0.cast::<u8>().sub(self.prev_size() + HEADER_SIZE) }.cast()))
  }

  pub fn info(self) -> BlockInfo {
    BlockInfo {
      addr: self.start_addr(),
      size: self.size(),
      prev_size: self.prev_size(),
      used: self.is_used(),
      first: self.is_first(),
      terminal: self.is_terminal(),
    }
  }

  /// Records which free-index node tracks this block. The block must be free.
  pub fn write_link(
    self,
    node: usize,
  ) {
    debug_assert!(!self.is_used());
    let link = self.payload().cast::<FreeLink>();
    unsafe { link.as_ptr().write(FreeLink { node, key: self.size() }) };
  }

  pub fn read_link(self) -> usize {
    let link = self.payload().cast::<FreeLink>();
    let (node, key) = unsafe { ((*link.as_ptr()).node, (*link.as_ptr()).key) };
    debug_assert_eq!(key, self.size(), "free link out of sync with boundary tag");
    node
  }
}

/// Marks `block` used and carves a free tail off it when the remainder can hold
/// a tag plus a minimal payload. Otherwise the remainder stays as slack.
pub(crate) fn split(
  block: BlockRef,
  amount: usize,
) -> Option<BlockRef> {
  debug_assert!(amount <= block.size());

  block.set_used(true);
  let remain = block.size() - amount;
  if remain < HEADER_SIZE + MIN_FREE_PAYLOAD {
    return None;
  }

  let tail_size = remain - HEADER_SIZE;
  let terminal = block.is_terminal();
  block.set_size(amount);

  let tail = unsafe { BlockRef::init(block.payload().add(amount), tail_size, amount, false, terminal) };

  if terminal {
    block.set_terminal(false);
  } else if let Some(next) = tail.next() {
    next.set_prev_size(tail_size);
  }

  Some(tail)
}

/// Absorbs `target`, the free right neighbour of `base`, into `base`.
pub(crate) fn coalesce(
  base: BlockRef,
  target: BlockRef,
) {
  debug_assert!(!target.is_used());
  debug_assert_eq!(base.next(), Some(target));

  let merged = base.size() + target.size() + HEADER_SIZE;
  base.set_size(merged);

  if target.is_terminal() {
    base.set_terminal(true);
  } else if let Some(next) = base.next() {
    next.set_prev_size(merged);
  }
}

/// Whole pages strictly inside a free block, leaving the tag and the free link
/// at the front of the payload untouched.
pub fn reclaimable_range(
  start_addr: usize,
  size: usize,
  page_size: usize,
) -> Option<Range<usize>> {
  if size < NODE_SIZE || size - NODE_SIZE < page_size {
    return None;
  }

  let first = align_to!(start_addr + HEADER_SIZE + NODE_SIZE, page_size);
  let last = align_down!(start_addr + size + HEADER_SIZE, page_size);

  (first < last).then_some(first..last)
}

/// Hands the interior pages of a large free block back to `source`.
pub(crate) fn release_hint<S: PageSource>(
  block: BlockRef,
  source: &mut S,
) -> Result<()> {
  let start = block.start_addr();
  let Some(range) = reclaimable_range(start, block.size(), source.page_size()) else {
    return Ok(());
  };

  log::trace!(
    "[BLOCK] release {:#x}..{:#x} ({} pages) of block {:#x}",
    range.start,
    range.end,
    range.len() / source.page_size(),
    start
  );

  unsafe {
    let from = block.0.cast::<u8>().add(range.start - start);
    source.mark_unused(from, range.len())
  }
}

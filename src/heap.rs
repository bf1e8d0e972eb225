use std::ptr::{self, NonNull};
use std::slice;

use crate::block::{self, BlockInfo, BlockRef};
use crate::config::{ALIGN, HEADER_SIZE, HeapConfig, MIN_FREE_PAYLOAD};
use crate::error::{HeapError, Result};
use crate::page::{MmapPageSource, PageSource, Region};
use crate::tree::{FreeIndex, NodeRef};
use crate::{align, align_to};

/// Payload address of a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonNull<u8>);

// A handle is an address; touching the memory behind it goes through the heap.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
  pub fn as_ptr(self) -> *mut u8 {
    self.0.as_ptr()
  }

  unsafe fn block(self) -> BlockRef {
    unsafe { BlockRef::from_payload(self.0) }
  }
}

/// A region mapped from the page source, tagged with the heap's arena counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
  pub id: u64,
  pub region: Region,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub arenas: usize,
  pub arena_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub distinct_free_sizes: usize,
  pub tree_height: usize,
}

/// Best-fit heap over boundary-tagged arenas.
///
/// Free blocks are indexed by size in a [`FreeIndex`]; physical neighbours are
/// found through boundary tags. Single owner: wrap it in a
/// [`LockedHeap`](crate::LockedHeap) to share it.
pub struct Heap<S: PageSource = MmapPageSource> {
  source: S,
  index: FreeIndex<BlockRef>,
  arenas: Vec<Arena>,
  next_arena_id: u64,
  config: HeapConfig,
}

// The heap exclusively owns every arena it points into.
unsafe impl<S: PageSource + Send> Send for Heap<S> {}

impl Heap<MmapPageSource> {
  pub fn new() -> Result<Self> {
    Self::with_config(HeapConfig::default())
  }

  pub fn with_config(config: HeapConfig) -> Result<Self> {
    Self::with_source(MmapPageSource::new(config.page_size, config.release), config)
  }
}

impl<S: PageSource> Heap<S> {
  pub fn with_source(
    source: S,
    config: HeapConfig,
  ) -> Result<Self> {
    config.validate()?;
    if source.page_size() != config.page_size {
      return Err(HeapError::InvalidConfig("page source and config disagree on page size"));
    }

    Ok(Self {
      source,
      index: FreeIndex::new(),
      arenas: Vec::new(),
      next_arena_id: 0,
      config,
    })
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn arenas(&self) -> &[Arena] {
    &self.arenas
  }

  fn request_size(size: usize) -> Result<usize> {
    if size > isize::MAX as usize - ALIGN {
      return Err(HeapError::OutOfMemory { requested: size });
    }
    Ok(align!(size.max(MIN_FREE_PAYLOAD)))
  }

  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<Handle> {
    let size = Self::request_size(size)?;

    let block = match self.take_best_fit(size) {
      Some(block) => block,
      None => {
        self.grow(size)?;
        self
          .take_best_fit(size)
          .ok_or(HeapError::OutOfMemory { requested: size })?
      }
    };

    if let Some(tail) = block::split(block, size) {
      self.index_block(tail);
    }

    log::trace!("[HEAP] allocate {} -> {:#x}", size, block.payload().as_ptr() as usize);
    Ok(Handle(block.payload()))
  }

  /// Changes the payload size of `handle`, moving it when it cannot grow in place.
  ///
  /// # Safety
  ///
  /// `handle` must be live and come from this heap. When the returned handle
  /// differs, the old one is dead.
  pub unsafe fn resize(
    &mut self,
    handle: Handle,
    new_size: usize,
  ) -> Result<Handle> {
    let requested = new_size;
    let new_size = Self::request_size(new_size)?;
    let block = unsafe { handle.block() };
    let current = block.size();

    if new_size == current {
      return Ok(handle);
    }

    if new_size < current {
      self.shrink(block, new_size);
      log::trace!("[HEAP] resize {:#x}: {} -> {} in place", handle.as_ptr() as usize, current, new_size);
      return Ok(handle);
    }

    if self.grow_in_place(block, new_size) {
      log::trace!("[HEAP] resize {:#x}: {} -> {} in place", handle.as_ptr() as usize, current, new_size);
      return Ok(handle);
    }

    let moved = self.allocate(requested)?;
    unsafe {
      ptr::copy_nonoverlapping(handle.as_ptr(), moved.as_ptr(), current.min(new_size));
      self.free(handle);
    }

    log::trace!(
      "[HEAP] resize {:#x}: {} -> {} moved to {:#x}",
      handle.as_ptr() as usize,
      current,
      new_size,
      moved.as_ptr() as usize
    );
    Ok(moved)
  }

  /// Returns a block to the heap, merging it with free neighbours.
  ///
  /// # Safety
  ///
  /// `handle` must be live and come from this heap. Freeing twice is undefined.
  pub unsafe fn free(
    &mut self,
    handle: Handle,
  ) {
    let mut block = unsafe { handle.block() };
    debug_assert!(block.is_used(), "free of a block that is not in use");

    log::trace!("[HEAP] free {:#x} ({} bytes)", handle.as_ptr() as usize, block.size());
    block.set_used(false);

    if let Some(prev) = block.prev() {
      if !prev.is_used() {
        self.unindex_block(prev);
        block::coalesce(prev, block);
        block = prev;
      }
    }

    if let Some(next) = block.next() {
      if !next.is_used() {
        self.unindex_block(next);
        block::coalesce(block, next);
      }
    }

    if let Err(err) = block::release_hint(block, &mut self.source) {
      log::warn!("[HEAP] page release for block {:#x} failed: {}", block.start_addr(), err);
    }

    self.index_block(block);
  }

  /// Usable bytes behind `handle`; at least what was requested.
  ///
  /// # Safety
  ///
  /// `handle` must be live and come from this heap.
  pub unsafe fn capacity(
    &self,
    handle: Handle,
  ) -> usize {
    unsafe { handle.block() }.size()
  }

  /// # Safety
  ///
  /// `handle` must be live and come from this heap.
  pub unsafe fn payload(
    &self,
    handle: Handle,
  ) -> &[u8] {
    unsafe { slice::from_raw_parts(handle.as_ptr(), self.capacity(handle)) }
  }

  /// # Safety
  ///
  /// `handle` must be live and come from this heap.
  pub unsafe fn payload_mut(
    &mut self,
    handle: Handle,
  ) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(handle.as_ptr(), self.capacity(handle)) }
  }

  /// Copies `bytes` into the payload at `offset`. Never truncates.
  ///
  /// # Safety
  ///
  /// `handle` must be live and come from this heap.
  pub unsafe fn write(
    &mut self,
    handle: Handle,
    offset: usize,
    bytes: &[u8],
  ) -> Result<()> {
    let capacity = unsafe { self.capacity(handle) };
    let end = Self::checked_end(capacity, offset, bytes.len())?;
    unsafe { self.payload_mut(handle)[offset..end].copy_from_slice(bytes) };
    Ok(())
  }

  /// # Safety
  ///
  /// `handle` must be live and come from this heap.
  pub unsafe fn read(
    &self,
    handle: Handle,
    offset: usize,
    len: usize,
  ) -> Result<&[u8]> {
    let capacity = unsafe { self.capacity(handle) };
    let end = Self::checked_end(capacity, offset, len)?;
    Ok(unsafe { &self.payload(handle)[offset..end] })
  }

  fn checked_end(
    capacity: usize,
    offset: usize,
    len: usize,
  ) -> Result<usize> {
    match offset.checked_add(len) {
      Some(end) if end <= capacity => Ok(end),
      end => Err(HeapError::InsufficientCapacity {
        capacity,
        required: end.unwrap_or(usize::MAX),
      }),
    }
  }

  fn shrink(
    &mut self,
    block: BlockRef,
    size: usize,
  ) {
    let Some(tail) = block::split(block, size) else {
      return;
    };

    if let Some(next) = tail.next() {
      if !next.is_used() {
        self.unindex_block(next);
        block::coalesce(tail, next);
      }
    }
    self.index_block(tail);
  }

  fn grow_in_place(
    &mut self,
    block: BlockRef,
    size: usize,
  ) -> bool {
    let Some(next) = block.next() else {
      return false;
    };
    if next.is_used() || block.size() + next.size() + HEADER_SIZE < size {
      return false;
    }

    self.unindex_block(next);
    block::coalesce(block, next);
    if let Some(tail) = block::split(block, size) {
      self.index_block(tail);
    }
    true
  }

  fn take_best_fit(
    &mut self,
    size: usize,
  ) -> Option<BlockRef> {
    let node = self.index.best_match(size)?;
    let block = *self.index.value(node);
    self.index.delete(node);
    Some(block)
  }

  /// Maps a new arena able to hold `size` bytes and indexes it as one free block.
  fn grow(
    &mut self,
    size: usize,
  ) -> Result<()> {
    let page = self.config.page_size;
    let len = align_to!(size + HEADER_SIZE, page).max(self.config.arena_size());
    let region = self.source.acquire(len)?;

    let id = self.next_arena_id;
    self.next_arena_id += 1;
    self.arenas.push(Arena { id, region });

    log::debug!(
      "[HEAP] arena #{} mapped: {} bytes at {:#x}",
      id,
      region.len,
      region.base.as_ptr() as usize
    );

    let block = unsafe { BlockRef::init(region.base, region.len - HEADER_SIZE, 0, true, true) };
    self.index_block(block);
    Ok(())
  }

  fn index_block(
    &mut self,
    block: BlockRef,
  ) {
    let node = self.index.insert(block.size(), block);
    block.write_link(node.index());
  }

  fn unindex_block(
    &mut self,
    block: BlockRef,
  ) {
    let node = NodeRef::from_index(block.read_link());
    debug_assert_eq!(*self.index.value(node), block);
    self.index.delete(node);
  }

  /// Free blocks in index order.
  pub fn free_blocks(&self) -> Vec<BlockInfo> {
    let mut blocks = Vec::with_capacity(self.index.len());
    self.index.iterate(|entry| blocks.push(entry.value.info()));
    blocks
  }

  /// Every block of every arena, in address order within each arena.
  pub fn blocks(&self) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    for arena in &self.arenas {
      let mut current = Some(unsafe { BlockRef::at(arena.region.base) });
      while let Some(block) = current {
        blocks.push(block.info());
        current = block.next();
      }
    }
    blocks
  }

  pub fn stats(&self) -> HeapStats {
    let mut free_bytes = 0;
    self.index.iterate(|entry| free_bytes += entry.key);

    HeapStats {
      arenas: self.arenas.len(),
      arena_bytes: self.arenas.iter().map(|a| a.region.len).sum(),
      free_blocks: self.index.len(),
      free_bytes,
      distinct_free_sizes: self.index.distinct_len(),
      tree_height: self.index.height(),
    }
  }

  /// Logs the free index, one line per free block.
  pub fn show(
    &self,
    msg: &str,
  ) {
    log::info!("[HEAP] {}:", msg);
    if self.index.is_empty() {
      log::info!("[HEAP]   free tree is empty");
      return;
    }

    self.index.iterate(|entry| {
      let info = entry.value.info();
      log::info!(
        "[HEAP]   [{:#018x}] {:>10} {:>10} {} {} {} {}",
        info.addr,
        info.size,
        info.prev_size,
        if info.used { "busy" } else { "free" },
        if info.first { "first" } else { "" },
        if info.terminal { "last" } else { "" },
        if entry.duplicate { "linked" } else { "" }
      );
    });
  }
}

impl<S: PageSource> Drop for Heap<S> {
  fn drop(&mut self) {
    for arena in self.arenas.drain(..) {
      log::debug!("[HEAP] arena #{} unmapped", arena.id);
      if let Err(err) = unsafe { self.source.release(arena.region) } {
        log::error!("[HEAP] releasing arena #{} failed: {}", arena.id, err);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checksum::checksum;
  use crate::config::{NODE_SIZE, UNUSED_SENTINEL};

  fn heap() -> Heap {
    Heap::new().unwrap()
  }

  fn block_addr(handle: Handle) -> usize {
    handle.as_ptr() as usize - HEADER_SIZE
  }

  /// Walks every arena and checks the tags against each other and the free index.
  fn check_tags(heap: &Heap) {
    for arena in heap.arenas() {
      let base = arena.region.base.as_ptr() as usize;
      let mut expected_addr = base;
      let mut prev: Option<BlockInfo> = None;

      let mut current = Some(unsafe { BlockRef::at(arena.region.base) });
      while let Some(block) = current {
        let info = block.info();
        assert_eq!(info.addr, expected_addr);
        assert_eq!(info.first, prev.is_none());
        if let Some(prev) = prev {
          assert_eq!(info.prev_size, prev.size);
          assert!(prev.used || info.used, "adjacent free blocks at {:#x}", info.addr);
        }
        expected_addr += HEADER_SIZE + info.size;
        prev = Some(info);
        current = block.next();
      }

      assert!(prev.map(|p| p.terminal).unwrap_or(false));
      assert_eq!(expected_addr, base + arena.region.len);
    }

    let mut walked: Vec<usize> = heap.blocks().iter().filter(|b| !b.used).map(|b| b.addr).collect();
    let mut indexed: Vec<usize> = heap.free_blocks().iter().map(|b| b.addr).collect();
    walked.sort_unstable();
    indexed.sort_unstable();
    assert_eq!(walked, indexed);
  }

  fn fill(
    heap: &mut Heap,
    handle: Handle,
    len: usize,
    seed: u8,
  ) -> u32 {
    let bytes: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
    unsafe { heap.write(handle, 0, &bytes).unwrap() };
    checksum(&bytes)
  }

  #[test]
  fn test_first_allocation_maps_arena() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();

    assert_eq!(heap.arenas().len(), 1);
    assert_eq!(a.as_ptr() as usize, heap.arenas()[0].region.base.as_ptr() as usize + HEADER_SIZE);
    assert_eq!(a.as_ptr() as usize % ALIGN, 0);
    assert_eq!(unsafe { heap.capacity(a) }, 104);
    check_tags(&heap);
  }

  #[test]
  fn test_small_requests_get_minimum_payload() {
    let mut heap = heap();
    let a = heap.allocate(0).unwrap();
    let b = heap.allocate(1).unwrap();

    assert_eq!(unsafe { heap.capacity(a) }, MIN_FREE_PAYLOAD);
    assert_eq!(unsafe { heap.capacity(b) }, MIN_FREE_PAYLOAD);
    assert_eq!(block_addr(b), block_addr(a) + HEADER_SIZE + MIN_FREE_PAYLOAD);
  }

  #[test]
  fn test_freed_block_is_reused_best_fit() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    let c = heap.allocate(100).unwrap();
    let d = heap.allocate(400).unwrap();
    let _e = heap.allocate(100).unwrap();

    unsafe {
      heap.free(b);
      heap.free(d);
    }
    check_tags(&heap);

    let f = heap.allocate(150).unwrap();
    assert_eq!(f, b);
    let g = heap.allocate(300).unwrap();
    assert_eq!(g, d);

    unsafe {
      heap.free(a);
      heap.free(c);
    }
    check_tags(&heap);
  }

  #[test]
  fn test_free_merges_both_neighbours() {
    let mut heap = heap();
    let a = heap.allocate(256).unwrap();
    let b = heap.allocate(256).unwrap();
    let c = heap.allocate(256).unwrap();

    unsafe {
      heap.free(a);
      heap.free(c);
    }
    assert_eq!(heap.free_blocks().len(), 2);
    check_tags(&heap);

    unsafe { heap.free(b) };
    check_tags(&heap);

    let blocks = heap.blocks();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].first && blocks[0].terminal && !blocks[0].used);
    assert_eq!(blocks[0].size, heap.arenas()[0].region.len - HEADER_SIZE);
  }

  #[test]
  fn test_shrink_releases_tail() {
    let mut heap = heap();
    let a = heap.allocate(1000).unwrap();
    let _b = heap.allocate(100).unwrap();

    let same = unsafe { heap.resize(a, 100) }.unwrap();
    assert_eq!(same, a);
    assert_eq!(unsafe { heap.capacity(a) }, 104);

    let tail = heap
      .free_blocks()
      .into_iter()
      .find(|f| f.addr == block_addr(a) + HEADER_SIZE + 104)
      .unwrap();
    assert_eq!(tail.size, 1000 - 104 - HEADER_SIZE);
    check_tags(&heap);
  }

  #[test]
  fn test_shrink_merges_tail_with_free_neighbour() {
    let mut heap = heap();
    let a = heap.allocate(1000).unwrap();
    let free_before = heap.free_blocks();
    assert_eq!(free_before.len(), 1);

    unsafe { heap.resize(a, 200) }.unwrap();

    let free_after = heap.free_blocks();
    assert_eq!(free_after.len(), 1);
    assert_eq!(free_after[0].size, free_before[0].size + 800);
    check_tags(&heap);
  }

  #[test]
  fn test_small_shrink_keeps_slack() {
    let mut heap = heap();
    let a = heap.allocate(1000).unwrap();

    let same = unsafe { heap.resize(a, 1000 - HEADER_SIZE) }.unwrap();
    assert_eq!(same, a);
    assert_eq!(unsafe { heap.capacity(a) }, 1000);
    check_tags(&heap);
  }

  #[test]
  fn test_grow_in_place_preserves_content() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let sum = fill(&mut heap, a, 100, 7);

    let grown = unsafe { heap.resize(a, 2000) }.unwrap();
    assert_eq!(grown, a);
    assert_eq!(unsafe { heap.capacity(a) }, 2000);
    assert_eq!(checksum(unsafe { heap.read(a, 0, 100) }.unwrap()), sum);
    check_tags(&heap);
  }

  #[test]
  fn test_grow_moves_when_neighbour_is_used() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let sum = fill(&mut heap, a, 100, 3);
    let b_sum = fill(&mut heap, b, 100, 9);

    let moved = unsafe { heap.resize(a, 500) }.unwrap();
    assert_ne!(moved, a);
    assert_eq!(checksum(unsafe { heap.read(moved, 0, 100) }.unwrap()), sum);
    assert_eq!(checksum(unsafe { heap.read(b, 0, 100) }.unwrap()), b_sum);

    let freed = heap.free_blocks().into_iter().find(|f| f.addr == block_addr(a));
    assert!(freed.is_some());
    check_tags(&heap);
  }

  #[test]
  fn test_resize_round_trip_preserves_prefix() {
    let mut heap = heap();
    let mut h = heap.allocate(5000).unwrap();
    let _guard = heap.allocate(64).unwrap();
    let sum = fill(&mut heap, h, 3000, 42);

    for size in [3000, 20_000, 3001, 70_000, 4000] {
      h = unsafe { heap.resize(h, size) }.unwrap();
      assert_eq!(checksum(unsafe { heap.read(h, 0, 3000) }.unwrap()), sum);
      check_tags(&heap);
    }
  }

  #[test]
  fn test_allocate_resize_free_leaves_whole_arenas() {
    let mut heap = heap();
    let a = heap.allocate(60_000).unwrap();
    let a = unsafe { heap.resize(a, 100_000) }.unwrap();
    assert!(unsafe { heap.capacity(a) } >= 100_000);
    unsafe { heap.free(a) };

    check_tags(&heap);
    let free = heap.free_blocks();
    assert_eq!(free.len(), heap.arenas().len());

    for arena in heap.arenas() {
      let base = arena.region.base.as_ptr() as usize;
      let block = free.iter().find(|f| f.addr == base).unwrap();
      assert!(block.first && block.terminal);
      assert_eq!(block.size + HEADER_SIZE, arena.region.len);
    }
  }

  #[test]
  fn test_large_request_gets_dedicated_arena() {
    let mut heap = heap();
    let arena_size = heap.config().arena_size();
    let _small = heap.allocate(64).unwrap();
    let big = heap.allocate(arena_size * 2).unwrap();

    assert_eq!(heap.arenas().len(), 2);
    assert_eq!(heap.arenas()[1].id, 1);
    assert_eq!(
      heap.arenas()[1].region.len,
      crate::align_to!(arena_size * 2 + HEADER_SIZE, heap.config().page_size)
    );
    assert!(unsafe { heap.capacity(big) } >= arena_size * 2);
    check_tags(&heap);
  }

  #[test]
  fn test_free_fills_interior_pages_with_sentinel() {
    let mut heap = heap();
    let page = heap.config().page_size;
    let big = heap.allocate(5 * page).unwrap();
    let _fence = heap.allocate(64).unwrap();
    fill(&mut heap, big, 5 * page, 1);

    unsafe { heap.free(big) };

    let info = heap.free_blocks().into_iter().find(|f| f.addr == block_addr(big)).unwrap();
    let range = block::reclaimable_range(info.addr, info.size, page).unwrap();
    let payload = unsafe { slice::from_raw_parts(big.as_ptr(), info.size) };
    let payload_start = info.addr + HEADER_SIZE;

    assert!(range.start >= payload_start + NODE_SIZE);
    assert!(
      payload[range.start - payload_start..range.end - payload_start]
        .iter()
        .all(|&b| b == UNUSED_SENTINEL)
    );
    check_tags(&heap);

    let again = heap.allocate(5 * page).unwrap();
    assert_eq!(again, big);
  }

  #[test]
  fn test_write_past_capacity_is_rejected() {
    let mut heap = heap();
    let a = heap.allocate(32).unwrap();

    assert_eq!(
      unsafe { heap.write(a, 16, &[0u8; 17]) },
      Err(HeapError::InsufficientCapacity { capacity: 32, required: 33 })
    );
    assert_eq!(
      unsafe { heap.read(a, usize::MAX, 2) },
      Err(HeapError::InsufficientCapacity { capacity: 32, required: usize::MAX })
    );
    assert!(unsafe { heap.write(a, 16, &[1u8; 16]) }.is_ok());
    assert_eq!(unsafe { heap.read(a, 16, 16) }.unwrap(), &[1u8; 16]);
  }

  #[test]
  fn test_impossible_request_is_out_of_memory() {
    let mut heap = heap();

    assert_eq!(heap.allocate(usize::MAX), Err(HeapError::OutOfMemory { requested: usize::MAX }));
    assert!(matches!(
      heap.allocate(isize::MAX as usize - 2 * ALIGN),
      Err(HeapError::OutOfMemory { .. })
    ));
    assert!(heap.arenas().is_empty());
  }

  #[test]
  fn test_mismatched_page_size_is_rejected() {
    let source = MmapPageSource::new(4096, Default::default());
    let config = HeapConfig::default().with_page_size(8192);
    assert!(matches!(Heap::with_source(source, config), Err(HeapError::InvalidConfig(_))));
  }

  #[test]
  fn test_stats_track_free_index() {
    let mut heap = heap();
    let handles: Vec<Handle> = (0..8).map(|_| heap.allocate(128).unwrap()).collect();
    for &h in handles.iter().step_by(2) {
      unsafe { heap.free(h) };
    }

    let stats = heap.stats();
    assert_eq!(stats.arenas, 1);
    assert_eq!(stats.free_blocks, 5);
    assert_eq!(stats.distinct_free_sizes, 2);
    assert_eq!(stats.arena_bytes, heap.config().arena_size());
    assert_eq!(
      stats.free_bytes,
      heap.free_blocks().iter().map(|b| b.size).sum::<usize>()
    );
  }
}

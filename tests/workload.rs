use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tagalloc::{BlockInfo, HEADER_SIZE, Handle, Heap, HeapConfig, ReleaseMode, checksum};

const SLOTS: usize = 100;
const ITERATIONS: usize = 1000;
const MAX_SIZE: usize = 40940;

struct Slot {
  handle: Handle,
  len: usize,
  sum: u32,
}

fn fill(
  heap: &mut Heap,
  rng: &mut StdRng,
  handle: Handle,
  len: usize,
) -> u32 {
  let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
  unsafe { heap.write(handle, 0, &bytes).unwrap() };
  checksum(&bytes)
}

fn assert_intact(
  heap: &Heap,
  slot: &Slot,
) {
  let bytes = unsafe { heap.read(slot.handle, 0, slot.len) }.unwrap();
  assert_eq!(checksum(bytes), slot.sum, "payload at {:p} changed", slot.handle.as_ptr());
}

/// Address order, prev_size links and no two adjacent free blocks, per arena.
fn assert_consistent(heap: &Heap) {
  let blocks = heap.blocks();
  let mut free_walked: Vec<usize> = Vec::new();

  for arena in heap.arenas() {
    let base = arena.region.base.as_ptr() as usize;
    let end = base + arena.region.len;
    let arena_blocks: Vec<&BlockInfo> = blocks
      .iter()
      .filter(|b| b.addr >= base && b.addr < end)
      .collect();

    let mut addr = base;
    for (i, block) in arena_blocks.iter().enumerate() {
      assert_eq!(block.addr, addr);
      assert_eq!(block.first, i == 0);
      assert_eq!(block.terminal, i + 1 == arena_blocks.len());
      if i > 0 {
        let prev = arena_blocks[i - 1];
        assert_eq!(block.prev_size, prev.size);
        assert!(prev.used || block.used, "adjacent free blocks at {:#x}", block.addr);
      }
      if !block.used {
        free_walked.push(block.addr);
      }
      addr += HEADER_SIZE + block.size;
    }
    assert_eq!(addr, end);
  }

  let mut free_indexed: Vec<usize> = heap.free_blocks().iter().map(|b| b.addr).collect();
  free_walked.sort_unstable();
  free_indexed.sort_unstable();
  assert_eq!(free_walked, free_indexed);

  let indexed = heap.free_blocks();
  assert!(indexed.windows(2).all(|w| w[0].size <= w[1].size));
}

fn run_workload(
  heap: &mut Heap,
  seed: u64,
) {
  let mut rng = StdRng::seed_from_u64(seed);
  let mut slots: Vec<Option<Slot>> = (0..SLOTS).map(|_| None).collect();

  for step in 0..ITERATIONS {
    let i = rng.random_range(0..SLOTS);
    match slots[i].take() {
      None => {
        let len = rng.random_range(1..=MAX_SIZE);
        let handle = heap.allocate(len).unwrap();
        assert!(unsafe { heap.capacity(handle) } >= len);
        let sum = fill(heap, &mut rng, handle, len);
        slots[i] = Some(Slot { handle, len, sum });
      }
      Some(slot) if rng.random_bool(0.5) => {
        assert_intact(heap, &slot);
        let len = rng.random_range(1..=MAX_SIZE);
        let kept = slot.len.min(len);
        let prefix = checksum(unsafe { heap.read(slot.handle, 0, kept) }.unwrap());

        let handle = unsafe { heap.resize(slot.handle, len) }.unwrap();
        assert!(unsafe { heap.capacity(handle) } >= len);
        assert_intact(
          heap,
          &Slot {
            handle,
            len: kept,
            sum: prefix,
          },
        );

        let sum = fill(heap, &mut rng, handle, len);
        slots[i] = Some(Slot { handle, len, sum });
      }
      Some(slot) => {
        assert_intact(heap, &slot);
        unsafe { heap.free(slot.handle) };
      }
    }

    if step % 50 == 0 {
      assert_consistent(heap);
      for slot in slots.iter().flatten() {
        assert_intact(heap, slot);
      }
    }
  }

  for slot in slots.into_iter().flatten() {
    assert_intact(heap, &slot);
    unsafe { heap.free(slot.handle) };
  }
  assert_consistent(heap);
}

fn assert_all_free(heap: &Heap) {
  let blocks = heap.blocks();
  assert_eq!(blocks.len(), heap.arenas().len());
  assert!(blocks.iter().all(|b| !b.used && b.first && b.terminal));
  assert_eq!(heap.stats().free_blocks, heap.arenas().len());
}

#[test]
fn test_random_workload_keeps_payloads() {
  let mut heap = Heap::new().unwrap();
  run_workload(&mut heap, 0x5eed);
  assert_all_free(&heap);
}

#[test]
fn test_random_workload_several_seeds() {
  for seed in [1, 7, 42, 1234] {
    let mut heap = Heap::new().unwrap();
    run_workload(&mut heap, seed);
    assert_all_free(&heap);
  }
}

#[test]
fn test_random_workload_with_page_advice() {
  for release in [ReleaseMode::Advise, ReleaseMode::SentinelThenAdvise] {
    let mut heap = Heap::with_config(HeapConfig::default().with_release_mode(release)).unwrap();
    run_workload(&mut heap, 99);
    assert_all_free(&heap);
  }
}

#[test]
fn test_small_arenas() {
  let config = HeapConfig::default().with_arena_pages(1);
  let mut heap = Heap::with_config(config).unwrap();
  run_workload(&mut heap, 2024);
  assert_all_free(&heap);
}


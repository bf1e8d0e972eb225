use log::{Level, LevelFilter, Log, Metadata, Record};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tagalloc::{Handle, Heap, HeapError, checksum};

/// Prints every record as `[LEVEL] message` on stdout.
struct StdoutLogger;

impl Log for StdoutLogger {
  fn enabled(
    &self,
    metadata: &Metadata,
  ) -> bool {
    metadata.level() <= Level::Info
  }

  fn log(
    &self,
    record: &Record,
  ) {
    if self.enabled(record.metadata()) {
      println!("[{}] {}", record.level(), record.args());
    }
  }

  fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

const SLOTS: usize = 100;
const ITERATIONS: usize = 1000;
const MAX_SIZE: usize = 40940;

/// Fixed sequence: four allocations, a growing resize, a free and a shrinking
/// resize, with the free tree printed after every step.
fn demo() -> Result<(), HeapError> {
  let mut heap = Heap::new()?;
  heap.show("initial state");

  let a = heap.allocate(50000)?;
  heap.show("allocate A (50000)");

  let b = heap.allocate(10)?;
  heap.show("allocate B (10)");

  let c = heap.allocate(12000)?;
  heap.show("allocate C (12000)");

  let d = heap.allocate(1500)?;
  heap.show("allocate D (1500)");

  unsafe {
    let a = heap.resize(a, 100000)?;
    heap.show("resize A to 100000");

    heap.free(a);
    heap.show("free A");

    let d = heap.resize(d, 2000)?;
    heap.show("resize D to 2000");

    heap.free(b);
    heap.free(c);
    heap.free(d);
  }
  heap.show("free B, C and D");

  let stats = heap.stats();
  println!(
    "arenas: {}, arena bytes: {}, free blocks: {}, free bytes: {}, tree height: {}",
    stats.arenas, stats.arena_bytes, stats.free_blocks, stats.free_bytes, stats.tree_height
  );
  Ok(())
}

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
) -> Result<u32, HeapError> {
  let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
  unsafe { heap.write(handle, 0, &bytes)? };
  Ok(checksum(&bytes))
}

fn verify(
  heap: &Heap,
  slot: &Slot,
) -> Result<(), HeapError> {
  let bytes = unsafe { heap.read(slot.handle, 0, slot.len)? };
  if checksum(bytes) != slot.sum {
    log::error!("[HEAP] checksum mismatch at {:#x}", slot.handle.as_ptr() as usize);
    std::process::exit(1);
  }
  Ok(())
}

/// Randomized workload over a fixed table of slots: every iteration picks a
/// slot and allocates, resizes or frees it, checking payload checksums along
/// the way.
fn run(seed: u64) -> Result<(), HeapError> {
  let mut heap = Heap::new()?;
  let mut rng = StdRng::seed_from_u64(seed);
  let mut slots: Vec<Option<Slot>> = (0..SLOTS).map(|_| None).collect();

  for _ in 0..ITERATIONS {
    let i = rng.random_range(0..SLOTS);
    match slots[i].take() {
      None => {
        let len = rng.random_range(1..=MAX_SIZE);
        let handle = heap.allocate(len)?;
        let sum = fill(&mut heap, &mut rng, handle, len)?;
        slots[i] = Some(Slot { handle, len, sum });
      }
      Some(slot) if rng.random_bool(0.5) => {
        verify(&heap, &slot)?;
        let len = rng.random_range(1..=MAX_SIZE);
        let kept = slot.len.min(len);
        let prefix = checksum(unsafe { heap.read(slot.handle, 0, kept)? });

        let handle = unsafe { heap.resize(slot.handle, len)? };
        let moved = Slot {
          handle,
          len: kept,
          sum: prefix,
        };
        verify(&heap, &moved)?;

        let sum = fill(&mut heap, &mut rng, handle, len)?;
        slots[i] = Some(Slot { handle, len, sum });
      }
      Some(slot) => {
        verify(&heap, &slot)?;
        unsafe { heap.free(slot.handle) };
      }
    }
  }

  for slot in slots.into_iter().flatten() {
    verify(&heap, &slot)?;
    unsafe { heap.free(slot.handle) };
  }

  heap.show("after run");
  let stats = heap.stats();
  println!(
    "{} iterations over {} slots: {} arenas, {} free blocks, tree height {}",
    ITERATIONS, SLOTS, stats.arenas, stats.free_blocks, stats.tree_height
  );
  Ok(())
}

fn usage() -> ! {
  eprintln!("usage: heap demo | heap run [seed]");
  std::process::exit(2);
}

fn main() {
  let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));

  let mut args = std::env::args().skip(1);
  let result = match args.next().as_deref() {
    Some("demo") => demo(),
    Some("run") => {
      let seed = match args.next() {
        Some(seed) => seed.parse().unwrap_or_else(|_| usage()),
        None => 0x5eed,
      };
      run(seed)
    }
    _ => usage(),
  };

  if let Err(err) = result {
    eprintln!("heap: {}", err);
    std::process::exit(1);
  }
}

//! # tagalloc - A Best-Fit Boundary-Tag Allocator
//!
//! This crate provides a general-purpose **best-fit heap** that manages memory
//! mapped with `mmap(2)`. Free blocks are indexed by size in an AVL tree;
//! physical neighbours are found through boundary tags.
//!
//! ## Overview
//!
//! ```text
//!   Arena (one mmap region):
//!
//!   ┌───┬────────┬───┬──────────────┬───┬──────┬───┬─────────────────────┐
//!   │tag│  used  │tag│     free     │tag│ used │tag│        free         │
//!   └───┴────────┴───┴──────────────┴───┴──────┴───┴─────────────────────┘
//!   first                 │                                    terminal │
//!                         │                                             │
//!   Free index:           ▼                                             ▼
//!                      ┌──────┐                                  ┌──────┐
//!                      │ 4032 │ ◄── AVL tree keyed by size ────► │ 9000 │
//!                      └──────┘                                  └──────┘
//! ```
//!
//! - **allocate(n)**: take the smallest free block `>= n` from the index,
//!   split off the remainder and index it. Map a new arena on a miss.
//! - **free(h)**: merge with free left/right neighbours (found by address
//!   arithmetic on the tags), hand interior pages back to the page source,
//!   index the merged block.
//! - **resize(h, n)**: shrink in place, grow into a free right neighbour, or
//!   move.
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Alignment macros (align!, align_to!, align_down!)
//!   ├── block      - Boundary tags: split, coalesce, release hint (internal)
//!   ├── checksum   - Payload checksum used by the workload tests
//!   ├── config     - Layout constants and HeapConfig
//!   ├── error      - HeapError
//!   ├── heap       - Heap: allocate / resize / free
//!   ├── page       - PageSource trait and the mmap implementation
//!   ├── sync       - LockedHeap
//!   └── tree       - FreeIndex, the size-keyed AVL tree
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tagalloc::Heap;
//!
//! fn main() -> Result<(), tagalloc::HeapError> {
//!     let mut heap = Heap::new()?;
//!
//!     let handle = heap.allocate(64)?;
//!     unsafe {
//!         heap.write(handle, 0, b"hello")?;
//!         let handle = heap.resize(handle, 4096)?;
//!         assert_eq!(heap.read(handle, 0, 5)?, b"hello");
//!         heap.free(handle);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Block Layout
//!
//! ```text
//!   Used block:                          Free block:
//!   ┌──────────────┬────────────────┐    ┌──────────────┬──────┬────────────────┐
//!   │ size         │                │    │ size         │ node │                │
//!   │ prev_size    │   N bytes      │    │ prev_size    │ key  │  released      │
//!   │ flags        │   usable       │    │ flags        │      │  pages         │
//!   └──────────────┴────────────────┘    └──────────────┴──────┴────────────────┘
//!     HEADER_SIZE  ▲                       HEADER_SIZE   NODE_SIZE
//!                  └── Handle
//! ```
//!
//! ## Limitations
//!
//! - **Single owner**: [`Heap`] is not `Sync`; use [`LockedHeap`] to share it
//! - **Trusted headers**: corrupted tags are undefined behaviour
//! - **Unix-only**: the default page source requires `libc` and `mmap`
//!
//! ## Safety
//!
//! Handles are plain addresses. Operations that take a handle are `unsafe`:
//! the caller guarantees it is live and belongs to the heap.

pub mod align;
mod block;
mod checksum;
mod config;
mod error;
mod heap;
mod page;
mod sync;
mod tree;

pub use block::{BlockInfo, reclaimable_range};
pub use checksum::checksum;
pub use config::{
  ALIGN, DEFAULT_ARENA_PAGES, HEADER_SIZE, HeapConfig, MIN_FREE_PAYLOAD, NODE_SIZE, ReleaseMode,
  UNUSED_SENTINEL,
};
pub use error::{HeapError, Result};
pub use heap::{Arena, Handle, Heap, HeapStats};
pub use page::{MmapPageSource, PageSource, Region, os_page_size};
pub use sync::LockedHeap;
pub use tree::{FreeEntry, FreeIndex, NodeRef};

//! One lock around the whole heap.
//!
//! [`Heap`] mutates its tree and boundary tags without any synchronization, so
//! every operation from every thread goes through the same mutex.

use spin::{Mutex, MutexGuard};

use crate::error::Result;
use crate::heap::{Handle, Heap};
use crate::page::{MmapPageSource, PageSource};

pub struct LockedHeap<S: PageSource = MmapPageSource> {
  inner: Mutex<Heap<S>>,
}

impl<S: PageSource> LockedHeap<S> {
  pub fn new(heap: Heap<S>) -> Self {
    Self {
      inner: Mutex::new(heap),
    }
  }

  /// Exclusive access for a sequence of operations, e.g. allocate then write.
  pub fn lock(&self) -> MutexGuard<'_, Heap<S>> {
    self.inner.lock()
  }

  pub fn allocate(
    &self,
    size: usize,
  ) -> Result<Handle> {
    self.inner.lock().allocate(size)
  }

  /// # Safety
  ///
  /// Same contract as [`Heap::resize`].
  pub unsafe fn resize(
    &self,
    handle: Handle,
    new_size: usize,
  ) -> Result<Handle> {
    unsafe { self.inner.lock().resize(handle, new_size) }
  }

  /// # Safety
  ///
  /// Same contract as [`Heap::free`].
  pub unsafe fn free(
    &self,
    handle: Handle,
  ) {
    unsafe { self.inner.lock().free(handle) }
  }

  pub fn into_inner(self) -> Heap<S> {
    self.inner.into_inner()
  }
}

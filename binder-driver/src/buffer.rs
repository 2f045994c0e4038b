use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::driver::Driver;

/// An inbound payload living in the driver's receive arena.
///
/// Ownership is linear: the kernel hands the slot over in a BR_TRANSACTION
/// or BR_REPLY frame, the decoded frame moves it into a carrier, and
/// dropping the handle returns the slot with exactly one BC_FREE_BUFFER.
pub struct Buffer {
  driver: Arc<Driver>,
  ptr: u64,
  size: usize,
  objects: Vec<u64>
}

impl Buffer {
  pub(crate) fn new(driver: Arc<Driver>, ptr: u64, size: usize, objects: Vec<u64>) -> Self {
    debug_assert!(ptr != 0);
    Self {
      driver,
      ptr,
      size,
      objects
    }
  }

  pub fn as_bytes(&self) -> &[u8] {
    if self.size == 0 {
      return &[];
    }
    // SAFETY: the kernel keeps [ptr, ptr + size) mapped and untouched in
    // the arena until we return it with BC_FREE_BUFFER, which only the
    // drop below does
    unsafe { std::slice::from_raw_parts(self.ptr as usize as *const u8, self.size) }
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Byte offsets of embedded object references within the payload.
  pub fn object_offsets(&self) -> &[u64] {
    &self.objects
  }
}

impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Buffer")
      .field("ptr", &format_args!("{:#x}", self.ptr))
      .field("size", &self.size)
      .field("objects", &self.objects.len())
      .finish()
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    if let Err(e) = self.driver.free_buffer(self.ptr) {
      warn!("BC_FREE_BUFFER {:#x} failed: {e}", self.ptr);
    }
  }
}

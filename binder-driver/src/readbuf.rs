use binder_io::IoBuf;

pub(crate) const READ_BUF_SIZE: usize = 256;

/// Scratch area the kernel fills with concatenated return frames. Bytes
/// left over after a dispatch pass (a frame the cursor arithmetic saw only
/// the head of) are compacted to offset zero so the next read appends
/// right after them.
pub(crate) struct ReadBuf {
  data: [u8; READ_BUF_SIZE],
  filled: usize
}

impl ReadBuf {
  pub fn new() -> Self {
    Self {
      data: [0; READ_BUF_SIZE],
      filled: 0
    }
  }

  /// Descriptor for the next write_read: the kernel appends after whatever
  /// residual bytes are already at the front.
  pub fn io_buf(&mut self) -> IoBuf {
    IoBuf {
      ptr: self.data.as_mut_ptr() as u64,
      size: READ_BUF_SIZE,
      consumed: self.filled
    }
  }

  /// Takes the kernel-updated cursor back after a write_read.
  pub fn absorb(&mut self, buf: &IoBuf) {
    debug_assert!(buf.consumed <= READ_BUF_SIZE);
    self.filled = buf.consumed;
  }

  pub fn bytes(&self) -> &[u8] {
    &self.data[..self.filled]
  }

  /// Bytes waiting at the front (residual partial frame after a dispatch
  /// pass, everything the kernel delivered before one).
  pub fn pending(&self) -> usize {
    self.filled
  }

  /// Drops the first `processed` bytes and moves the rest to the front.
  pub fn compact(&mut self, processed: usize) {
    debug_assert!(processed <= self.filled);
    self.data.copy_within(processed..self.filled, 0);
    self.filled -= processed;
  }
}

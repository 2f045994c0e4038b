// Wire-level binder protocol: the two kernel ABIs (32 and 64-bit pointers),
// their BC_*/BR_* opcode tables and the encoders/decoders for the command
// frames that travel over BINDER_WRITE_READ.

mod io;
mod tx;

pub use io::{BcCodes, BinderIo, BrCodes, Io32, Io64, IO_32, IO_64};
pub use tx::{Payload, TxData, TxFlag};

// Equivalent to struct binder_version
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
  pub version: i32
}

/// Picks the ABI descriptor matching a kernel-reported protocol version.
pub fn io_for_version(version: i32) -> Option<&'static dyn BinderIo> {
  if version == IO_32.version() {
    Some(&IO_32)
  } else if version == IO_64.version() {
    Some(&IO_64)
  } else {
    None
  }
}

// The payload length of every command frame is encoded in the opcode
// itself, _IOC_SIZE style
const IOC_SIZE_SHIFT: u32 = 16;
const IOC_SIZE_MASK: u32 = 0x3fff;

pub const fn ioc_size(code: u32) -> usize {
  ((code >> IOC_SIZE_SHIFT) & IOC_SIZE_MASK) as usize
}

/// One side of the kernel's binder_write_read argument. `ptr` and `size`
/// describe the whole buffer, `consumed` is the cursor the kernel advances
/// in place.
#[derive(Debug, Clone, Copy)]
pub struct IoBuf {
  pub ptr: u64,
  pub size: usize,
  pub consumed: usize
}

impl IoBuf {
  pub fn from_slice(bytes: &[u8]) -> Self {
    Self {
      ptr: bytes.as_ptr() as u64,
      size: bytes.len(),
      consumed: 0
    }
  }

  pub fn remaining(&self) -> usize {
    self.size - self.consumed
  }
}

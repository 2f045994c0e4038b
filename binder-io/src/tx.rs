use enumflags2::{bitflags, BitFlags};

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFlag {
  OneWay = 0x01,
  RootObject = 0x04,
  StatusCode = 0x08,
  AcceptFds = 0x10,
  ClearBuffer = 0x20,
  UpdateTransaction = 0x40
}

/// A transaction decoded from an inbound BR_TRANSACTION or BR_REPLY frame.
///
/// `data` points into the driver's mmap arena; whoever ends up holding it
/// owes the kernel exactly one BC_FREE_BUFFER for it (a zero `data` needs
/// no free).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxData {
  /// Cookie of the target local object (zero for replies).
  pub target: u64,
  pub code: u32,
  pub flags: BitFlags<TxFlag>,
  /// Decoded status: the i32 carried in the payload when StatusCode is
  /// set, zero otherwise.
  pub status: i32,
  pub pid: i32,
  pub euid: u32,
  /// Arena address of the payload, zero if the payload is empty.
  pub data: u64,
  pub size: usize,
  /// Byte offsets of embedded object references within the payload.
  pub offsets: Vec<u64>
}

/// Borrowed view of an outgoing payload: the flat bytes, the offsets of
/// embedded object references, and the summed size of out-of-line buffers
/// (non-zero only for the scatter-gather transaction forms).
#[derive(Clone, Copy)]
pub struct Payload<'data> {
  pub bytes: &'data [u8],
  pub offsets: &'data [u64],
  pub buffers_size: u64
}

impl<'data> Payload<'data> {
  pub fn new(bytes: &'data [u8], offsets: &'data [u64]) -> Self {
    Self {
      bytes,
      offsets,
      buffers_size: 0
    }
  }
}

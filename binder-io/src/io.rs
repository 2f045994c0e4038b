// The two kernel ABIs. The binder wire structs embed pointer-sized fields,
// so every frame layout (and therefore every opcode value, which carries the
// payload size _IOC_SIZE style) exists in a 32-bit and a 64-bit flavor. The
// kernel reports which one it speaks through BINDER_VERSION and the session
// picks the matching descriptor once at construction.

use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};

use bytemuck::Zeroable;
use enumflags2::BitFlags;
use nix::errno::Errno;

use crate::{IoBuf, Payload, TxData, TxFlag};

/// Userspace -> kernel command opcodes.
pub struct BcCodes {
  pub transaction: u32,
  pub reply: u32,
  pub acquire_result: u32,
  pub free_buffer: u32,
  pub increfs: u32,
  pub acquire: u32,
  pub release: u32,
  pub decrefs: u32,
  pub increfs_done: u32,
  pub acquire_done: u32,
  pub register_looper: u32,
  pub enter_looper: u32,
  pub exit_looper: u32,
  pub request_death_notification: u32,
  pub clear_death_notification: u32,
  pub dead_binder_done: u32,
  pub transaction_sg: u32,
  pub reply_sg: u32
}

/// Kernel -> userspace return opcodes.
pub struct BrCodes {
  pub error: u32,
  pub ok: u32,
  pub transaction: u32,
  pub reply: u32,
  pub acquire_result: u32,
  pub dead_reply: u32,
  pub transaction_complete: u32,
  pub increfs: u32,
  pub acquire: u32,
  pub release: u32,
  pub decrefs: u32,
  pub noop: u32,
  pub spawn_looper: u32,
  pub finished: u32,
  pub dead_binder: u32,
  pub clear_death_notification_done: u32,
  pub failed_reply: u32
}

/// One kernel ABI: opcode tables plus the encoder/decoder family for its
/// frame layouts and the matching binder_write_read ioctl.
///
/// The encoders that take raw payload references (`encode_transaction`,
/// `encode_status_reply`) embed the referent's address in the produced
/// frame; the referent has to stay alive and unmoved until the frame has
/// been written to the kernel.
pub trait BinderIo: Send + Sync {
  fn version(&self) -> i32;
  fn pointer_size(&self) -> usize;
  fn bc(&self) -> &'static BcCodes;
  fn br(&self) -> &'static BrCodes;

  fn encode_pointer(&self, out: &mut Vec<u8>, ptr: u64);
  fn encode_cookie(&self, out: &mut Vec<u8>, cookie: u64);
  fn encode_ptr_cookie(&self, out: &mut Vec<u8>, ptr: u64, cookie: u64);
  fn encode_death_notification(&self, out: &mut Vec<u8>, handle: u32, cookie: u64);
  fn encode_status_reply(&self, out: &mut Vec<u8>, status: &i32);

  /// Appends a transaction header for `payload`. Returns the scratch block
  /// holding the ABI-sized offsets array the header points into; the caller
  /// keeps it alive until the frame has been written.
  fn encode_transaction(
    &self,
    out: &mut Vec<u8>,
    handle: u32,
    code: u32,
    flags: BitFlags<TxFlag>,
    payload: &Payload<'_>
  ) -> Vec<u8>;

  /// Scatter-gather form: like `encode_transaction` but with the summed
  /// size of out-of-line buffers in the trailer.
  fn encode_transaction_sg(
    &self,
    out: &mut Vec<u8>,
    handle: u32,
    code: u32,
    flags: BitFlags<TxFlag>,
    payload: &Payload<'_>
  ) -> Vec<u8>;

  fn decode_ptr_cookie(&self, data: &[u8]) -> (u64, u64);
  fn decode_cookie(&self, data: &[u8]) -> u64;
  fn decode_transaction_data(&self, data: &[u8]) -> TxData;

  /// The fused BINDER_WRITE_READ ioctl. Operates at `ptr + consumed` on
  /// both sides and advances `consumed` by however much the kernel took
  /// or delivered. EAGAIN is surfaced, not retried.
  fn write_read(
    &self,
    fd: BorrowedFd<'_>,
    write: Option<&mut IoBuf>,
    read: Option<&mut IoBuf>
  ) -> Result<(), Errno>;
}

pub struct Io32;
pub struct Io64;

pub static IO_32: Io32 = Io32;
pub static IO_64: Io64 = Io64;

macro_rules! binder_abi {
  ($abi:ident, $io:ty, $uptr:ty, $version:expr) => {
    mod $abi {
      use super::*;
      use std::mem::size_of;
      use bytemuck::{Pod, Zeroable};
      use nix::{ioctl_readwrite, request_code_none, request_code_read, request_code_write};

      pub type Uptr = $uptr;
      pub const VERSION: i32 = $version;

      // Target of an outgoing transaction: a handle for remote objects, a
      // raw object pointer for local ones. The kernel only reads the
      // variant the opcode implies
      #[repr(C)]
      #[derive(Clone, Copy, Zeroable)]
      pub union TargetUnion {
        pub handle: u32,
        pub ptr: Uptr
      }

      unsafe impl Pod for TargetUnion {}

      #[repr(C)]
      #[derive(Clone, Copy, Pod, Zeroable)]
      pub struct TxPtrPair {
        pub buffer: Uptr,
        pub offsets: Uptr
      }

      #[repr(C)]
      #[derive(Clone, Copy, Zeroable)]
      pub union TxDataUnion {
        pub ptr: TxPtrPair,
        pub raw: [u8; 8]
      }

      unsafe impl Pod for TxDataUnion {}

      // Equivalent to struct binder_transaction_data
      #[repr(C)]
      #[derive(Clone, Copy, Pod, Zeroable)]
      pub struct TransactionData {
        pub target: TargetUnion,
        pub cookie: Uptr,
        pub code: u32,
        pub flags: u32,
        pub sender_pid: i32,
        pub sender_euid: u32,
        pub data_size: Uptr,
        pub offsets_size: Uptr,
        pub data: TxDataUnion
      }

      // Equivalent to struct binder_transaction_data_sg
      #[repr(C)]
      #[derive(Clone, Copy, Pod, Zeroable)]
      pub struct TransactionDataSg {
        pub tx: TransactionData,
        pub buffers_size: Uptr
      }

      // Equivalent to struct binder_ptr_cookie
      #[repr(C)]
      #[derive(Clone, Copy, Pod, Zeroable)]
      pub struct PtrCookie {
        pub ptr: Uptr,
        pub cookie: Uptr
      }

      // Equivalent to struct binder_handle_cookie (packed in the kernel
      // headers, hence no padding between the u32 and the pointer)
      #[repr(C, packed)]
      #[derive(Clone, Copy, Pod, Zeroable)]
      pub struct HandleCookie {
        pub handle: u32,
        pub cookie: Uptr
      }

      // Equivalent to struct binder_write_read
      #[repr(C)]
      #[derive(Clone, Copy, Pod, Zeroable)]
      pub struct WriteRead {
        pub write_size: Uptr,
        pub write_consumed: Uptr,
        pub write_buffer: Uptr,
        pub read_size: Uptr,
        pub read_consumed: Uptr,
        pub read_buffer: Uptr
      }

      const BINDER_IOC_MAGIC: u8 = b'b';
      const BINDER_CMD_MAGIC: u8 = b'c';
      const BINDER_RET_MAGIC: u8 = b'r';

      ioctl_readwrite!(ioctl_write_read, BINDER_IOC_MAGIC, 1, WriteRead);

      pub const BC: BcCodes = BcCodes {
        transaction: request_code_write!(BINDER_CMD_MAGIC, 0, size_of::<TransactionData>()) as u32,
        reply: request_code_write!(BINDER_CMD_MAGIC, 1, size_of::<TransactionData>()) as u32,
        acquire_result: request_code_write!(BINDER_CMD_MAGIC, 2, size_of::<i32>()) as u32,
        free_buffer: request_code_write!(BINDER_CMD_MAGIC, 3, size_of::<Uptr>()) as u32,
        increfs: request_code_write!(BINDER_CMD_MAGIC, 4, size_of::<u32>()) as u32,
        acquire: request_code_write!(BINDER_CMD_MAGIC, 5, size_of::<u32>()) as u32,
        release: request_code_write!(BINDER_CMD_MAGIC, 6, size_of::<u32>()) as u32,
        decrefs: request_code_write!(BINDER_CMD_MAGIC, 7, size_of::<u32>()) as u32,
        increfs_done: request_code_write!(BINDER_CMD_MAGIC, 8, size_of::<PtrCookie>()) as u32,
        acquire_done: request_code_write!(BINDER_CMD_MAGIC, 9, size_of::<PtrCookie>()) as u32,
        register_looper: request_code_none!(BINDER_CMD_MAGIC, 11) as u32,
        enter_looper: request_code_none!(BINDER_CMD_MAGIC, 12) as u32,
        exit_looper: request_code_none!(BINDER_CMD_MAGIC, 13) as u32,
        request_death_notification: request_code_write!(BINDER_CMD_MAGIC, 14, size_of::<HandleCookie>()) as u32,
        clear_death_notification: request_code_write!(BINDER_CMD_MAGIC, 15, size_of::<HandleCookie>()) as u32,
        dead_binder_done: request_code_write!(BINDER_CMD_MAGIC, 16, size_of::<Uptr>()) as u32,
        transaction_sg: request_code_write!(BINDER_CMD_MAGIC, 17, size_of::<TransactionDataSg>()) as u32,
        reply_sg: request_code_write!(BINDER_CMD_MAGIC, 18, size_of::<TransactionDataSg>()) as u32
      };

      pub const BR: BrCodes = BrCodes {
        error: request_code_read!(BINDER_RET_MAGIC, 0, size_of::<i32>()) as u32,
        ok: request_code_none!(BINDER_RET_MAGIC, 1) as u32,
        transaction: request_code_read!(BINDER_RET_MAGIC, 2, size_of::<TransactionData>()) as u32,
        reply: request_code_read!(BINDER_RET_MAGIC, 3, size_of::<TransactionData>()) as u32,
        acquire_result: request_code_read!(BINDER_RET_MAGIC, 4, size_of::<i32>()) as u32,
        dead_reply: request_code_none!(BINDER_RET_MAGIC, 5) as u32,
        transaction_complete: request_code_none!(BINDER_RET_MAGIC, 6) as u32,
        increfs: request_code_read!(BINDER_RET_MAGIC, 7, size_of::<PtrCookie>()) as u32,
        acquire: request_code_read!(BINDER_RET_MAGIC, 8, size_of::<PtrCookie>()) as u32,
        release: request_code_read!(BINDER_RET_MAGIC, 9, size_of::<PtrCookie>()) as u32,
        decrefs: request_code_read!(BINDER_RET_MAGIC, 10, size_of::<PtrCookie>()) as u32,
        noop: request_code_none!(BINDER_RET_MAGIC, 12) as u32,
        spawn_looper: request_code_none!(BINDER_RET_MAGIC, 13) as u32,
        finished: request_code_none!(BINDER_RET_MAGIC, 14) as u32,
        dead_binder: request_code_read!(BINDER_RET_MAGIC, 15, size_of::<Uptr>()) as u32,
        clear_death_notification_done: request_code_read!(BINDER_RET_MAGIC, 16, size_of::<Uptr>()) as u32,
        failed_reply: request_code_none!(BINDER_RET_MAGIC, 17) as u32
      };

      pub fn tx_raw(
        handle: u32,
        code: u32,
        flags: BitFlags<TxFlag>,
        payload: &Payload<'_>
      ) -> (TransactionData, Vec<u8>) {
        let mut scratch = Vec::with_capacity(payload.offsets.len() * size_of::<Uptr>());
        for &offset in payload.offsets {
          scratch.extend_from_slice(bytemuck::bytes_of(&(offset as Uptr)));
        }

        let mut raw = TransactionData::zeroed();
        raw.target.handle = handle;
        raw.code = code;
        raw.flags = flags.bits();
        raw.data_size = payload.bytes.len() as Uptr;
        raw.offsets_size = scratch.len() as Uptr;
        raw.data.ptr = TxPtrPair {
          buffer: if payload.bytes.is_empty() { 0 } else { payload.bytes.as_ptr() as usize as Uptr },
          offsets: if scratch.is_empty() { 0 } else { scratch.as_ptr() as usize as Uptr }
        };
        (raw, scratch)
      }
    }

    impl BinderIo for $io {
      fn version(&self) -> i32 {
        $abi::VERSION
      }

      fn pointer_size(&self) -> usize {
        size_of::<$abi::Uptr>()
      }

      fn bc(&self) -> &'static BcCodes {
        &$abi::BC
      }

      fn br(&self) -> &'static BrCodes {
        &$abi::BR
      }

      fn encode_pointer(&self, out: &mut Vec<u8>, ptr: u64) {
        out.extend_from_slice(bytemuck::bytes_of(&(ptr as $abi::Uptr)));
      }

      fn encode_cookie(&self, out: &mut Vec<u8>, cookie: u64) {
        self.encode_pointer(out, cookie);
      }

      fn encode_ptr_cookie(&self, out: &mut Vec<u8>, ptr: u64, cookie: u64) {
        let raw = $abi::PtrCookie {
          ptr: ptr as $abi::Uptr,
          cookie: cookie as $abi::Uptr
        };
        out.extend_from_slice(bytemuck::bytes_of(&raw));
      }

      fn encode_death_notification(&self, out: &mut Vec<u8>, handle: u32, cookie: u64) {
        let raw = $abi::HandleCookie {
          handle,
          cookie: cookie as $abi::Uptr
        };
        out.extend_from_slice(bytemuck::bytes_of(&raw));
      }

      fn encode_status_reply(&self, out: &mut Vec<u8>, status: &i32) {
        let mut raw = $abi::TransactionData::zeroed();
        raw.flags = BitFlags::from(TxFlag::StatusCode).bits();
        raw.data_size = size_of::<i32>() as $abi::Uptr;
        raw.data.ptr = $abi::TxPtrPair {
          buffer: status as *const i32 as usize as $abi::Uptr,
          offsets: 0
        };
        out.extend_from_slice(bytemuck::bytes_of(&raw));
      }

      fn encode_transaction(
        &self,
        out: &mut Vec<u8>,
        handle: u32,
        code: u32,
        flags: BitFlags<TxFlag>,
        payload: &Payload<'_>
      ) -> Vec<u8> {
        let (raw, scratch) = $abi::tx_raw(handle, code, flags, payload);
        out.extend_from_slice(bytemuck::bytes_of(&raw));
        scratch
      }

      fn encode_transaction_sg(
        &self,
        out: &mut Vec<u8>,
        handle: u32,
        code: u32,
        flags: BitFlags<TxFlag>,
        payload: &Payload<'_>
      ) -> Vec<u8> {
        let (tx, scratch) = $abi::tx_raw(handle, code, flags, payload);
        let raw = $abi::TransactionDataSg {
          tx,
          buffers_size: payload.buffers_size as $abi::Uptr
        };
        out.extend_from_slice(bytemuck::bytes_of(&raw));
        scratch
      }

      fn decode_ptr_cookie(&self, data: &[u8]) -> (u64, u64) {
        let raw: $abi::PtrCookie =
          bytemuck::pod_read_unaligned(&data[..size_of::<$abi::PtrCookie>()]);
        (raw.ptr as u64, raw.cookie as u64)
      }

      fn decode_cookie(&self, data: &[u8]) -> u64 {
        bytemuck::pod_read_unaligned::<$abi::Uptr>(&data[..size_of::<$abi::Uptr>()]) as u64
      }

      fn decode_transaction_data(&self, data: &[u8]) -> TxData {
        let raw: $abi::TransactionData =
          bytemuck::pod_read_unaligned(&data[..size_of::<$abi::TransactionData>()]);
        let flags = BitFlags::<TxFlag>::from_bits_truncate(raw.flags);
        // SAFETY: both variants of the data union are plain integers
        let pair = unsafe { raw.data.ptr };
        let size = raw.data_size as usize;
        // Keep the pointer even for empty payloads: a zero-size buffer can
        // still occupy an arena slot that wants its BC_FREE_BUFFER
        let buffer = pair.buffer as u64;

        let offsets_size = raw.offsets_size as usize;
        let mut offsets = Vec::new();
        if pair.offsets != 0 && offsets_size >= size_of::<$abi::Uptr>() {
          // The offsets array lives in the same arena allocation as the
          // payload and stays mapped until BC_FREE_BUFFER
          let bytes = unsafe {
            std::slice::from_raw_parts(pair.offsets as usize as *const u8, offsets_size)
          };
          offsets = bytes
            .chunks_exact(size_of::<$abi::Uptr>())
            .map(|chunk| bytemuck::pod_read_unaligned::<$abi::Uptr>(chunk) as u64)
            .collect();
        }

        let status = if flags.contains(TxFlag::StatusCode) && buffer != 0 && size >= size_of::<i32>() {
          // A status-only payload carries a single i32
          unsafe { (buffer as usize as *const i32).read_unaligned() }
        } else {
          0
        };

        TxData {
          target: raw.cookie as u64,
          code: raw.code,
          flags,
          status,
          pid: raw.sender_pid,
          euid: raw.sender_euid,
          data: buffer,
          size,
          offsets
        }
      }

      fn write_read(
        &self,
        fd: BorrowedFd<'_>,
        mut write: Option<&mut IoBuf>,
        mut read: Option<&mut IoBuf>
      ) -> Result<(), Errno> {
        let mut bwr = $abi::WriteRead::zeroed();
        if let Some(w) = write.as_deref() {
          bwr.write_buffer = (w.ptr + w.consumed as u64) as $abi::Uptr;
          bwr.write_size = w.remaining() as $abi::Uptr;
        }
        if let Some(r) = read.as_deref() {
          bwr.read_buffer = (r.ptr + r.consumed as u64) as $abi::Uptr;
          bwr.read_size = r.remaining() as $abi::Uptr;
        }

        unsafe { $abi::ioctl_write_read(fd.as_raw_fd(), &mut bwr) }?;

        if let Some(w) = write.as_deref_mut() {
          w.consumed += bwr.write_consumed as usize;
        }
        if let Some(r) = read.as_deref_mut() {
          r.consumed += bwr.read_consumed as usize;
        }
        Ok(())
      }
    }
  };
}

binder_abi!(abi32, Io32, u32, 7);
binder_abi!(abi64, Io64, u64, 8);

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ioc_size;

  fn both() -> [&'static dyn BinderIo; 2] {
    [&IO_32, &IO_64]
  }

  #[test]
  fn opcode_sizes_match_frame_layouts() {
    for io in both() {
      let psize = io.pointer_size();
      assert_eq!(ioc_size(io.bc().free_buffer), psize);
      assert_eq!(ioc_size(io.bc().increfs), 4);
      assert_eq!(ioc_size(io.bc().increfs_done), 2 * psize);
      assert_eq!(ioc_size(io.bc().acquire_done), 2 * psize);
      assert_eq!(ioc_size(io.bc().request_death_notification), 4 + psize);
      assert_eq!(ioc_size(io.bc().enter_looper), 0);
      assert_eq!(ioc_size(io.bc().exit_looper), 0);
      assert_eq!(
        ioc_size(io.bc().transaction_sg),
        ioc_size(io.bc().transaction) + psize
      );
      assert_eq!(ioc_size(io.br().transaction), ioc_size(io.bc().transaction));
      assert_eq!(ioc_size(io.br().dead_binder), psize);
      assert_eq!(ioc_size(io.br().failed_reply), 0);
    }
  }

  #[test]
  fn transaction_sizes() {
    assert_eq!(ioc_size(IO_32.bc().transaction), 40);
    assert_eq!(ioc_size(IO_64.bc().transaction), 64);
    assert_eq!(ioc_size(IO_32.bc().transaction_sg), 44);
    assert_eq!(ioc_size(IO_64.bc().transaction_sg), 72);
  }

  #[test]
  fn ptr_cookie_round_trip() {
    for io in both() {
      let mut out = Vec::new();
      io.encode_ptr_cookie(&mut out, 0x1234, 0x5678);
      assert_eq!(out.len(), 2 * io.pointer_size());
      assert_eq!(io.decode_ptr_cookie(&out), (0x1234, 0x5678));
    }
  }

  #[test]
  fn cookie_round_trip() {
    for io in both() {
      let mut out = Vec::new();
      io.encode_cookie(&mut out, 42);
      assert_eq!(out.len(), io.pointer_size());
      assert_eq!(io.decode_cookie(&out), 42);
    }
  }

  #[test]
  fn transaction_round_trip_with_objects() {
    for io in both() {
      let bytes = *b"payload bytes!!!";
      let object_offsets = [0u64, 8];
      let payload = Payload::new(&bytes, &object_offsets);

      let mut out = Vec::new();
      let scratch = io.encode_transaction(&mut out, 7, 3, TxFlag::AcceptFds.into(), &payload);
      assert_eq!(out.len(), ioc_size(io.bc().transaction));
      assert_eq!(scratch.len(), object_offsets.len() * io.pointer_size());

      let tx = io.decode_transaction_data(&out);
      assert_eq!(tx.code, 3);
      assert_eq!(tx.flags, BitFlags::from(TxFlag::AcceptFds));
      assert_eq!(tx.size, bytes.len());
      assert_eq!(tx.data, bytes.as_ptr() as u64);
      assert_eq!(tx.offsets, object_offsets);
      assert_eq!(tx.status, 0);
    }
  }

  #[test]
  fn transaction_round_trip_empty_payload() {
    for io in both() {
      let payload = Payload::new(&[], &[]);
      let mut out = Vec::new();
      let scratch = io.encode_transaction(&mut out, 1, 2, BitFlags::from(TxFlag::OneWay), &payload);
      assert!(scratch.is_empty());

      let tx = io.decode_transaction_data(&out);
      assert_eq!(tx.data, 0);
      assert_eq!(tx.size, 0);
      assert!(tx.offsets.is_empty());
      assert_eq!(tx.flags, BitFlags::from(TxFlag::OneWay));
    }
  }

  #[test]
  fn transaction_sg_carries_extra_buffers_size() {
    for io in both() {
      let bytes = [1u8, 2, 3, 4];
      let mut payload = Payload::new(&bytes, &[]);
      payload.buffers_size = 128;

      let mut out = Vec::new();
      let _scratch = io.encode_transaction_sg(&mut out, 9, 1, BitFlags::empty(), &payload);
      assert_eq!(out.len(), ioc_size(io.bc().transaction_sg));

      // The trailer is the last pointer-sized field
      let trailer = &out[out.len() - io.pointer_size()..];
      let mut expect = Vec::new();
      io.encode_pointer(&mut expect, 128);
      assert_eq!(trailer, expect.as_slice());
    }
  }

  #[test]
  fn status_reply_decodes_as_status() {
    for io in both() {
      let status = -22i32;
      let mut out = Vec::new();
      io.encode_status_reply(&mut out, &status);
      let tx = io.decode_transaction_data(&out);
      assert_eq!(tx.status, -22);
      assert!(tx.flags.contains(TxFlag::StatusCode));
      assert_eq!(tx.size, size_of::<i32>());
    }
  }

  #[test]
  fn death_notification_layout() {
    for io in both() {
      let mut out = Vec::new();
      io.encode_death_notification(&mut out, 12, 12);
      // binder_handle_cookie is packed
      assert_eq!(out.len(), 4 + io.pointer_size());
      assert_eq!(out.len(), ioc_size(io.bc().request_death_notification));
      assert_eq!(&out[..4], &12u32.to_ne_bytes());
    }
  }
}

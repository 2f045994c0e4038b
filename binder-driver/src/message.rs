// Request and reply carriers. Outgoing containers own flat bytes plus the
// offsets of embedded object references; inbound containers own the arena
// buffer (and with it the free-buffer obligation).

use std::cell::OnceCell;

use binder_io::Payload;

use crate::buffer::Buffer;
use crate::protocol::RpcProtocol;

#[derive(Default)]
struct OutBody {
  bytes: Vec<u8>,
  offsets: Vec<u64>,
  buffers_size: u64
}

impl OutBody {
  fn payload(&self) -> Payload<'_> {
    Payload {
      bytes: &self.bytes,
      offsets: &self.offsets,
      buffers_size: self.buffers_size
    }
  }
}

/// Appends into an outgoing container. Everything lands 4-byte aligned the
/// way the receiving parcel code expects.
pub struct Writer<'out> {
  body: &'out mut OutBody
}

impl Writer<'_> {
  fn pad4(&mut self) -> &mut Self {
    while self.body.bytes.len() % 4 != 0 {
      self.body.bytes.push(0);
    }
    self
  }

  pub fn len(&self) -> usize {
    self.body.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.body.bytes.is_empty()
  }

  pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
    self.body.bytes.extend_from_slice(bytes);
    self
  }

  pub fn append_u32(&mut self, value: u32) -> &mut Self {
    self.append_bytes(&value.to_ne_bytes())
  }

  pub fn append_i32(&mut self, value: i32) -> &mut Self {
    self.append_bytes(&value.to_ne_bytes())
  }

  /// Length-prefixed UTF-16 string, NUL terminated, padded to 4.
  pub fn append_str16(&mut self, s: &str) -> &mut Self {
    let units: Vec<u16> = s.encode_utf16().collect();
    self.append_i32(units.len() as i32);
    for unit in units {
      self.append_bytes(&unit.to_ne_bytes());
    }
    self.append_bytes(&0u16.to_ne_bytes());
    self.pad4()
  }

  /// NUL-terminated UTF-8 string, padded to 4.
  pub fn append_str8(&mut self, s: &str) -> &mut Self {
    self.append_bytes(s.as_bytes());
    self.body.bytes.push(0);
    self.pad4()
  }

  /// Appends a raw flattened object and records its offset so the kernel
  /// translates the reference in flight.
  pub fn append_object(&mut self, raw: &[u8]) -> &mut Self {
    self.pad4();
    self.body.offsets.push(self.body.bytes.len() as u64);
    self.append_bytes(raw)
  }

  /// Accounts for an out-of-line buffer that will ride along with the
  /// transaction; a non-zero total switches the engine to the
  /// scatter-gather command forms. Sizes are carried 8-byte aligned.
  pub fn note_out_of_line(&mut self, len: usize) -> &mut Self {
    self.body.buffers_size += len.next_multiple_of(8) as u64;
    self
  }
}

macro_rules! out_container {
  ($name:ident) => {
    impl $name {
      pub fn new() -> Self {
        Self {
          body: OutBody::default()
        }
      }

      pub fn writer(&mut self) -> Writer<'_> {
        Writer {
          body: &mut self.body
        }
      }

      pub fn bytes(&self) -> &[u8] {
        &self.body.bytes
      }

      pub fn object_offsets(&self) -> &[u64] {
        &self.body.offsets
      }

      pub fn buffers_size(&self) -> u64 {
        self.body.buffers_size
      }

      pub(crate) fn payload(&self) -> Payload<'_> {
        self.body.payload()
      }
    }

    impl Default for $name {
      fn default() -> Self {
        Self::new()
      }
    }
  };
}

/// Payload of an outgoing transaction.
pub struct LocalRequest {
  body: OutBody
}

/// Payload produced by a local object in answer to an inbound transaction.
pub struct LocalReply {
  body: OutBody
}

out_container!(LocalRequest);
out_container!(LocalReply);

/// An inbound transaction as handed to local objects: sender credentials,
/// the session's RPC protocol and (unless the payload was empty) the arena
/// buffer.
pub struct RemoteRequest {
  pid: i32,
  euid: u32,
  protocol: &'static RpcProtocol,
  buffer: Option<Buffer>,
  header: OnceCell<Option<(String, usize)>>
}

impl RemoteRequest {
  pub(crate) fn new(protocol: &'static RpcProtocol, pid: i32, euid: u32) -> Self {
    Self {
      pid,
      euid,
      protocol,
      buffer: None,
      header: OnceCell::new()
    }
  }

  pub(crate) fn set_buffer(&mut self, buffer: Buffer) {
    self.buffer = Some(buffer);
  }

  pub fn sender_pid(&self) -> i32 {
    self.pid
  }

  pub fn sender_euid(&self) -> u32 {
    self.euid
  }

  /// The whole payload, RPC header included.
  pub fn data(&self) -> &[u8] {
    self.buffer.as_ref().map(Buffer::as_bytes).unwrap_or(&[])
  }

  fn header(&self) -> Option<&(String, usize)> {
    self
      .header
      .get_or_init(|| self.protocol.read_rpc_header(self.data()))
      .as_ref()
  }

  /// Interface name from the RPC header, if the payload starts with one.
  pub fn interface(&self) -> Option<&str> {
    self.header().map(|(name, _)| name.as_str())
  }

  /// Payload past the RPC header (the whole payload if no header parsed).
  pub fn args(&self) -> &[u8] {
    let data = self.data();
    let skip = self.header().map(|&(_, len)| len).unwrap_or(0);
    &data[skip.min(data.len())..]
  }

  pub fn buffer(&self) -> Option<&Buffer> {
    self.buffer.as_ref()
  }

  /// Takes the arena buffer out, moving the free obligation to the caller.
  pub fn take_buffer(&mut self) -> Option<Buffer> {
    self.buffer.take()
  }
}

/// Reply carrier for an outgoing transaction; `transact` parks the decoded
/// BR_REPLY payload here.
#[derive(Default, Debug)]
pub struct RemoteReply {
  buffer: Option<Buffer>
}

impl RemoteReply {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn set_buffer(&mut self, buffer: Buffer) {
    self.buffer = Some(buffer);
  }

  pub fn data(&self) -> &[u8] {
    self.buffer.as_ref().map(Buffer::as_bytes).unwrap_or(&[])
  }

  pub fn is_empty(&self) -> bool {
    self.data().is_empty()
  }

  pub fn buffer(&self) -> Option<&Buffer> {
    self.buffer.as_ref()
  }

  pub fn take_buffer(&mut self) -> Option<Buffer> {
    self.buffer.take()
  }
}

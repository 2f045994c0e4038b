// Per-device RPC conventions: how the interface token at the head of every
// request payload is written and read back. The device path decides which
// convention a session speaks.

use crate::message::Writer;

pub struct RpcProtocol {
  pub name: &'static str,
  write_header: fn(&mut Writer<'_>, &str),
  read_header: fn(&[u8]) -> Option<(String, usize)>
}

impl RpcProtocol {
  /// Prefixes an outgoing request with the interface token.
  pub fn write_rpc_header(&self, writer: &mut Writer<'_>, iface: &str) {
    (self.write_header)(writer, iface)
  }

  /// Parses the token off an inbound payload. Returns the interface name
  /// and the number of header bytes consumed.
  pub fn read_rpc_header(&self, data: &[u8]) -> Option<(String, usize)> {
    (self.read_header)(data)
  }
}

// Strict-mode policy word the framework puts in front of the token
const STRICT_MODE_PENALTY_GATHER: i32 = 0x40 << 16;

fn aidl_write(writer: &mut Writer<'_>, iface: &str) {
  writer.append_i32(STRICT_MODE_PENALTY_GATHER);
  writer.append_str16(iface);
}

fn aidl_read(data: &[u8]) -> Option<(String, usize)> {
  if data.len() < 8 {
    return None;
  }
  let count = i32::from_ne_bytes(data[4..8].try_into().unwrap());
  if count < 0 {
    return None;
  }
  let count = count as usize;
  let end = 8usize.checked_add(count.checked_mul(2)?)?;
  // Terminator included
  if data.len() < end + 2 {
    return None;
  }
  let units: Vec<u16> = data[8..end]
    .chunks_exact(2)
    .map(|pair| u16::from_ne_bytes(pair.try_into().unwrap()))
    .collect();
  let name = String::from_utf16(&units).ok()?;
  let consumed = (end + 2).next_multiple_of(4);
  Some((name, consumed.min(data.len())))
}

fn hidl_write(writer: &mut Writer<'_>, iface: &str) {
  writer.append_str8(iface);
}

fn hidl_read(data: &[u8]) -> Option<(String, usize)> {
  let nul = data.iter().position(|&b| b == 0)?;
  let name = std::str::from_utf8(&data[..nul]).ok()?;
  if name.is_empty() {
    return None;
  }
  let consumed = (nul + 1).next_multiple_of(4);
  Some((name.to_owned(), consumed.min(data.len())))
}

pub static PROTOCOL_AIDL: RpcProtocol = RpcProtocol {
  name: "aidl",
  write_header: aidl_write,
  read_header: aidl_read
};

pub static PROTOCOL_HIDL: RpcProtocol = RpcProtocol {
  name: "hidl",
  write_header: hidl_write,
  read_header: hidl_read
};

/// Protocol for a device path: hwbinder devices speak the hidl convention,
/// everything else the aidl one.
pub fn protocol_for_device(dev: &str) -> &'static RpcProtocol {
  let base = dev.rsplit('/').next().unwrap_or(dev);
  if base == "hwbinder" {
    &PROTOCOL_HIDL
  } else {
    &PROTOCOL_AIDL
  }
}

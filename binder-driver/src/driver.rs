use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use binder_io::{io_for_version, ioc_size, BinderIo, IoBuf, TxData, TxFlag};
use enumflags2::BitFlags;
use log::{debug, error, log_enabled, trace, warn, Level};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{sysconf, SysconfVar};

use crate::buffer::Buffer;
use crate::message::{LocalReply, LocalRequest, RemoteReply, RemoteRequest};
use crate::object::{Handler, ObjectRegistry, TransactionSupport};
use crate::protocol::{protocol_for_device, RpcProtocol};
use crate::readbuf::ReadBuf;
use crate::sys::{Arena, BinderSys, KernelSys};
use crate::{STATUS_DEAD_OBJECT, STATUS_FAILED, STATUS_OK};

// The kernel never spawns looper threads unless asked; callers run their own
const DEFAULT_MAX_THREADS: u32 = 0;

// BINDER_VM_SIZE from the Android reference
fn arena_size() -> usize {
  let page = sysconf(SysconfVar::PAGE_SIZE)
    .ok()
    .flatten()
    .map(|v| v as usize)
    .unwrap_or(4096);
  (1 << 20) - 2 * page
}

#[derive(Debug, PartialEq, Eq)]
pub enum OpenError {
  Open(Errno),
  Version(Errno),
  UnsupportedVersion(i32),
  Mmap(Errno)
}

impl fmt::Display for OpenError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OpenError::Open(e) => write!(f, "can't open binder device: {e}"),
      OpenError::Version(e) => write!(f, "can't query binder version: {e}"),
      OpenError::UnsupportedVersion(v) => write!(f, "unexpected binder version {v}"),
      OpenError::Mmap(e) => write!(f, "can't map receive arena: {e}")
    }
  }
}

impl std::error::Error for OpenError {}

/// An open binder device session: the file handle, the receive arena, the
/// negotiated ABI and the device's RPC header convention. Shared through
/// `Arc`; the last drop unmaps the arena, then closes the handle.
///
/// Nothing in here mutates after construction, so any number of caller
/// threads can drive `transact`/`read` on the same session; the kernel is
/// the serialization point.
pub struct Driver {
  dev: String,
  io: &'static dyn BinderIo,
  protocol: &'static RpcProtocol,
  // Field order matters: the arena unmaps before the fd closes
  _arena: Arena,
  fd: OwnedFd,
  sys: Arc<dyn BinderSys>
}

impl std::fmt::Debug for Driver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Driver").field("dev", &self.dev).finish_non_exhaustive()
  }
}

impl Driver {
  pub fn open(dev: &str) -> Result<Arc<Self>, OpenError> {
    Self::open_with(Arc::new(KernelSys), dev, DEFAULT_MAX_THREADS)
  }

  pub fn open_with_max_threads(dev: &str, max_threads: u32) -> Result<Arc<Self>, OpenError> {
    Self::open_with(Arc::new(KernelSys), dev, max_threads)
  }

  /// Full-control constructor; `sys` is the kernel seam (tests substitute
  /// a scripted one).
  pub fn open_with(
    sys: Arc<dyn BinderSys>,
    dev: &str,
    max_threads: u32
  ) -> Result<Arc<Self>, OpenError> {
    let fd = sys.open(dev).map_err(OpenError::Open)?;

    let version = sys.version(fd.as_fd()).map_err(OpenError::Version)?;
    let io = io_for_version(version).ok_or_else(|| {
      error!("{dev} unexpected version {version}");
      OpenError::UnsupportedVersion(version)
    })?;
    debug!("Opened {dev} version {version}");

    // The chunk of address space the kernel copies inbound transactions to
    let arena = sys
      .mmap_arena(fd.as_fd(), arena_size())
      .map_err(|e| {
        error!("{dev} failed to mmap: {e}");
        OpenError::Mmap(e)
      })?;

    if let Err(e) = sys.set_max_threads(fd.as_fd(), max_threads) {
      error!("{dev} failed to set max threads ({max_threads}): {e}");
    }

    Ok(Arc::new(Self {
      dev: dev.to_owned(),
      io,
      protocol: protocol_for_device(dev),
      _arena: arena,
      fd,
      sys
    }))
  }

  pub fn dev(&self) -> &str {
    &self.dev
  }

  pub fn io(&self) -> &'static dyn BinderIo {
    self.io
  }

  pub(crate) fn protocol(&self) -> &'static RpcProtocol {
    self.protocol
  }

  /// Only used by unit tests.
  pub fn fd(&self) -> BorrowedFd<'_> {
    self.fd.as_fd()
  }

  /// Level-triggered wait on the binder handle, optionally multiplexed
  /// with one caller-supplied handle. Returns the revents of both (the
  /// extra one empty if not given).
  pub fn poll(
    &self,
    extra: Option<(BorrowedFd<'_>, PollFlags)>
  ) -> Result<(PollFlags, PollFlags), Errno> {
    let binder_events =
      PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;

    match extra {
      Some((fd, events)) => {
        let mut fds = [
          PollFd::new(self.fd.as_fd(), binder_events),
          PollFd::new(fd, events)
        ];
        poll(&mut fds, PollTimeout::NONE)?;
        Ok((
          fds[0].revents().unwrap_or(PollFlags::empty()),
          fds[1].revents().unwrap_or(PollFlags::empty())
        ))
      }
      None => {
        let mut fds = [PollFd::new(self.fd.as_fd(), binder_events)];
        poll(&mut fds, PollTimeout::NONE)?;
        Ok((fds[0].revents().unwrap_or(PollFlags::empty()), PollFlags::empty()))
      }
    }
  }

  // ===== write-side plumbing =====

  // The kernel's EAGAIN here means "try again immediately"; it never
  // escapes these two wrappers
  fn write(&self, write: &mut IoBuf) -> Result<(), Errno> {
    loop {
      if log_enabled!(Level::Trace) {
        trace_dump('<', pending_write_bytes(write));
      }
      match self.sys.write_read(self.fd.as_fd(), self.io, Some(&mut *write), None) {
        Err(Errno::EAGAIN) => continue,
        other => return other
      }
    }
  }

  fn write_read(&self, mut write: Option<&mut IoBuf>, rb: &mut ReadBuf) -> Result<(), Errno> {
    loop {
      let mut read = rb.io_buf();
      let before = read.consumed;
      if let Some(w) = write.as_deref() {
        if log_enabled!(Level::Trace) {
          trace_dump('<', pending_write_bytes(w));
        }
      }
      match self
        .sys
        .write_read(self.fd.as_fd(), self.io, write.as_deref_mut(), Some(&mut read))
      {
        Err(Errno::EAGAIN) => continue,
        Err(e) => return Err(e),
        Ok(()) => {
          rb.absorb(&read);
          if log_enabled!(Level::Trace) {
            trace_dump('>', &rb.bytes()[before..]);
          }
          return Ok(());
        }
      }
    }
  }

  fn cmd(&self, opcode: u32) -> Result<(), Errno> {
    let frame = opcode.to_ne_bytes();
    self.write(&mut IoBuf::from_slice(&frame))
  }

  fn cmd_u32(&self, opcode: u32, arg: u32) -> Result<(), Errno> {
    let mut frame = Vec::with_capacity(8);
    frame.extend_from_slice(&opcode.to_ne_bytes());
    frame.extend_from_slice(&arg.to_ne_bytes());
    self.write(&mut IoBuf::from_slice(&frame))
  }

  fn cmd_payload(&self, opcode: u32, payload: &[u8]) -> Result<(), Errno> {
    debug_assert_eq!(payload.len(), ioc_size(opcode));
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&opcode.to_ne_bytes());
    frame.extend_from_slice(payload);
    self.write(&mut IoBuf::from_slice(&frame))
  }

  // ===== outgoing commands =====

  pub fn increfs(&self, handle: u32) -> Result<(), Errno> {
    trace!("< BC_INCREFS 0x{handle:08x}");
    self.cmd_u32(self.io.bc().increfs, handle)
  }

  pub fn decrefs(&self, handle: u32) -> Result<(), Errno> {
    trace!("< BC_DECREFS 0x{handle:08x}");
    self.cmd_u32(self.io.bc().decrefs, handle)
  }

  pub fn acquire(&self, handle: u32) -> Result<(), Errno> {
    trace!("< BC_ACQUIRE 0x{handle:08x}");
    self.cmd_u32(self.io.bc().acquire, handle)
  }

  pub fn release(&self, handle: u32) -> Result<(), Errno> {
    trace!("< BC_RELEASE 0x{handle:08x}");
    self.cmd_u32(self.io.bc().release, handle)
  }

  pub fn enter_looper(&self) -> Result<(), Errno> {
    trace!("< BC_ENTER_LOOPER");
    self.cmd(self.io.bc().enter_looper)
  }

  pub fn exit_looper(&self) -> Result<(), Errno> {
    trace!("< BC_EXIT_LOOPER");
    self.cmd(self.io.bc().exit_looper)
  }

  pub fn request_death_notification(&self, handle: u32) -> Result<(), Errno> {
    trace!("< BC_REQUEST_DEATH_NOTIFICATION 0x{handle:08x}");
    self.death_notification(self.io.bc().request_death_notification, handle)
  }

  pub fn clear_death_notification(&self, handle: u32) -> Result<(), Errno> {
    trace!("< BC_CLEAR_DEATH_NOTIFICATION 0x{handle:08x}");
    self.death_notification(self.io.bc().clear_death_notification, handle)
  }

  fn death_notification(&self, opcode: u32, handle: u32) -> Result<(), Errno> {
    let mut payload = Vec::new();
    // The cookie mirrors the handle so BR_DEAD_BINDER maps straight back
    // to the remote object
    self.io.encode_death_notification(&mut payload, handle, handle as u64);
    self.cmd_payload(opcode, &payload)
  }

  pub(crate) fn free_buffer(&self, ptr: u64) -> Result<(), Errno> {
    if ptr == 0 {
      return Ok(());
    }
    trace!("< BC_FREE_BUFFER 0x{ptr:x}");
    let mut payload = Vec::new();
    self.io.encode_pointer(&mut payload, ptr);
    self.cmd_payload(self.io.bc().free_buffer, &payload)
  }

  /// New outgoing request already carrying the device protocol's RPC
  /// header for `iface`.
  pub fn local_request_new(&self, iface: &str) -> LocalRequest {
    let mut req = LocalRequest::new();
    self.protocol.write_rpc_header(&mut req.writer(), iface);
    req
  }

  fn reply_status(&self, status: i32) -> Result<(), Errno> {
    trace!("< BC_REPLY ({status})");
    let mut frame = Vec::new();
    frame.extend_from_slice(&self.io.bc().reply.to_ne_bytes());
    // The encoded header points at `status`; it lives until the write is
    // done
    self.io.encode_status_reply(&mut frame, &status);
    self.write(&mut IoBuf::from_slice(&frame))
  }

  fn reply_data(&self, reply: &LocalReply) -> Result<(), Errno> {
    let payload = reply.payload();
    let mut frame = Vec::new();
    let _offsets_scratch;
    if payload.buffers_size > 0 {
      trace!("< BC_REPLY_SG {} bytes", payload.buffers_size);
      frame.extend_from_slice(&self.io.bc().reply_sg.to_ne_bytes());
      _offsets_scratch = self.io.encode_transaction_sg(&mut frame, 0, 0, BitFlags::empty(), &payload);
    } else {
      trace!("< BC_REPLY");
      frame.extend_from_slice(&self.io.bc().reply.to_ne_bytes());
      _offsets_scratch = self.io.encode_transaction(&mut frame, 0, 0, BitFlags::empty(), &payload);
    }
    self.write(&mut IoBuf::from_slice(&frame))
  }

  // ===== inbound dispatch =====

  fn ack_ptr_cookie(&self, opcode: u32, ptr: u64, cookie: u64) {
    let mut payload = Vec::new();
    self.io.encode_ptr_cookie(&mut payload, ptr, cookie);
    if let Err(e) = self.cmd_payload(opcode, &payload) {
      warn!("ref-count acknowledge failed: {e}");
    }
  }

  fn handle_command(
    self: &Arc<Self>,
    reg: &dyn ObjectRegistry,
    handler: Option<&dyn Handler>,
    opcode: u32,
    data: &[u8]
  ) {
    let br = self.io.br();
    if opcode == br.noop {
      trace!("> BR_NOOP");
    } else if opcode == br.ok {
      trace!("> BR_OK");
    } else if opcode == br.transaction_complete {
      trace!("> BR_TRANSACTION_COMPLETE");
    } else if opcode == br.spawn_looper {
      // Spawning looper threads is the caller's business
      trace!("> BR_SPAWN_LOOPER");
    } else if opcode == br.finished {
      trace!("> BR_FINISHED");
    } else if opcode == br.increfs {
      let (ptr, cookie) = self.io.decode_ptr_cookie(data);
      trace!("> BR_INCREFS 0x{cookie:x}");
      if let Some(obj) = reg.get_local(cookie) {
        obj.handle_increfs();
      }
      trace!("< BC_INCREFS_DONE 0x{cookie:x}");
      self.ack_ptr_cookie(self.io.bc().increfs_done, ptr, cookie);
    } else if opcode == br.decrefs {
      let (_, cookie) = self.io.decode_ptr_cookie(data);
      trace!("> BR_DECREFS 0x{cookie:x}");
      if let Some(obj) = reg.get_local(cookie) {
        obj.handle_decrefs();
      }
    } else if opcode == br.acquire {
      let (ptr, cookie) = self.io.decode_ptr_cookie(data);
      trace!("> BR_ACQUIRE 0x{cookie:x}");
      if let Some(obj) = reg.get_local(cookie) {
        obj.handle_acquire();
      }
      trace!("< BC_ACQUIRE_DONE 0x{cookie:x}");
      self.ack_ptr_cookie(self.io.bc().acquire_done, ptr, cookie);
    } else if opcode == br.release {
      let (_, cookie) = self.io.decode_ptr_cookie(data);
      trace!("> BR_RELEASE 0x{cookie:x}");
      if let Some(obj) = reg.get_local(cookie) {
        obj.handle_release();
      }
    } else if opcode == br.transaction {
      self.handle_transaction(reg, handler, data);
    } else if opcode == br.dead_binder {
      let cookie = self.io.decode_cookie(data);
      trace!("> BR_DEAD_BINDER {cookie}");
      if let Some(obj) = reg.get_remote(cookie as u32) {
        obj.handle_death_notification();
      }
    } else if opcode == br.clear_death_notification_done {
      trace!("> BR_CLEAR_DEATH_NOTIFICATION_DONE");
    } else {
      warn!("Unexpected command 0x{opcode:08x}");
    }
  }

  fn handle_transaction(
    self: &Arc<Self>,
    reg: &dyn ObjectRegistry,
    handler: Option<&dyn Handler>,
    data: &[u8]
  ) {
    let tx = self.io.decode_transaction_data(data);
    verbose_transaction("BR_TRANSACTION", &tx);

    let mut req = RemoteRequest::new(self.protocol(), tx.pid, tx.euid);
    let obj = reg.get_local(tx.target);

    // The request now owes the kernel the BC_FREE_BUFFER
    if tx.data != 0 && tx.size > 0 {
      req.set_buffer(Buffer::new(self.clone(), tx.data, tx.size, tx.offsets));
    } else if let Err(e) = self.free_buffer(tx.data) {
      warn!("can't free empty transaction buffer: {e}");
    }

    let iface = req.interface().map(str::to_owned);
    let mut reply = None;
    let mut status = -(Errno::EBADMSG as i32);
    match &obj {
      Some(target) => match target.can_handle_transaction(iface.as_deref(), tx.code) {
        TransactionSupport::Looper => {
          let (r, s) = target.handle_looper_transaction(&mut req, tx.code, tx.flags);
          reply = r;
          status = s;
        }
        TransactionSupport::Application => match handler {
          Some(h) => {
            let (r, s) = h.transact(target, &mut req, tx.code, tx.flags);
            reply = r;
            status = s;
          }
          None => warn!("No handler for transaction 0x{:08x}", tx.code)
        },
        TransactionSupport::None => warn!("Unhandled transaction 0x{:08x}", tx.code)
      },
      None => warn!("Unhandled transaction 0x{:08x}", tx.code)
    }

    // One-way transactions get no reply
    if !tx.flags.contains(TxFlag::OneWay) {
      let sent = match &reply {
        Some(reply) => self.reply_data(reply),
        None => self.reply_status(status)
      };
      if let Err(e) = sent {
        warn!("can't send reply: {e}");
      }
    }

    // req (and with it an unconsumed arena buffer), reply and obj go here
  }

  /// Runs the generic dispatch over everything currently in the read
  /// buffer and compacts the residual to the front.
  fn handle_commands(
    self: &Arc<Self>,
    reg: &dyn ObjectRegistry,
    handler: Option<&dyn Handler>,
    rb: &mut ReadBuf
  ) {
    let mut consumed = 0;
    loop {
      let bytes = rb.bytes();
      let Some((opcode, datalen)) = next_command(&bytes[consumed..]) else {
        break;
      };
      self.handle_command(reg, handler, opcode, &bytes[consumed + 4..consumed + 4 + datalen]);
      consumed += 4 + datalen;
    }
    rb.compact(consumed);
  }

  /// Dispatch pass used while a transaction is pending: like
  /// `handle_commands` but watching for this thread's terminal frame.
  /// Returns None while the transaction is still in flight.
  fn txstatus(
    self: &Arc<Self>,
    reg: &dyn ObjectRegistry,
    rb: &mut ReadBuf,
    mut reply: Option<&mut RemoteReply>
  ) -> Option<Result<i32, Errno>> {
    let oneway = reply.is_none();
    let br = self.io.br();
    let mut consumed = 0;
    let mut result = None;

    while result.is_none() {
      let bytes = rb.bytes();
      let Some((opcode, datalen)) = next_command(&bytes[consumed..]) else {
        break;
      };
      let data = &bytes[consumed + 4..consumed + 4 + datalen];

      if opcode == br.transaction_complete {
        trace!("> BR_TRANSACTION_COMPLETE");
        if oneway {
          result = Some(Ok(STATUS_OK));
        }
      } else if opcode == br.dead_reply {
        trace!("> BR_DEAD_REPLY");
        result = Some(Ok(STATUS_DEAD_OBJECT));
      } else if opcode == br.failed_reply {
        trace!("> BR_FAILED_REPLY");
        result = Some(Ok(STATUS_FAILED));
      } else if opcode == br.reply {
        let tx = self.io.decode_transaction_data(data);
        verbose_transaction("BR_REPLY", &tx);

        if tx.data != 0 && tx.size > 0 {
          match reply.as_deref_mut() {
            // The reply carrier takes over the arena slot
            Some(r) => r.set_buffer(Buffer::new(self.clone(), tx.data, tx.size, tx.offsets)),
            None => {
              if let Err(e) = self.free_buffer(tx.data) {
                warn!("can't free unclaimed reply buffer: {e}");
              }
            }
          }
        } else if let Err(e) = self.free_buffer(tx.data) {
          warn!("can't free empty reply buffer: {e}");
        }

        let mut status = tx.status;
        // A remote status of -EAGAIN would collide with nothing here (the
        // pending state is an Option), but it cannot legitimately happen
        debug_assert!(status != -(Errno::EAGAIN as i32));
        if status == -(Errno::EAGAIN as i32) {
          status = -(Errno::EFAULT as i32);
        }
        result = Some(Ok(status));
      } else {
        self.handle_command(reg, None, opcode, data);
      }

      consumed += 4 + datalen;
    }

    rb.compact(consumed);
    result
  }

  /// One outgoing transaction. A `None` reply carrier makes it one-way:
  /// the call returns as soon as the kernel confirms the transaction with
  /// BR_TRANSACTION_COMPLETE. Otherwise the loop runs until this
  /// transaction's terminal frame arrives, dispatching unrelated inbound
  /// traffic along the way.
  ///
  /// Ok is the transaction status (zero for success); Err is a driver
  /// error from the kernel.
  pub fn transact(
    self: &Arc<Self>,
    reg: &dyn ObjectRegistry,
    handle: u32,
    code: u32,
    req: &LocalRequest,
    mut reply: Option<&mut RemoteReply>
  ) -> Result<i32, Errno> {
    let payload = req.payload();
    let flags = if reply.is_some() {
      BitFlags::empty()
    } else {
      BitFlags::from(TxFlag::OneWay)
    };

    let mut frame = Vec::new();
    let _offsets_scratch;
    if payload.buffers_size > 0 {
      trace!(
        "< BC_TRANSACTION_SG 0x{handle:08x} 0x{code:08x} {} bytes",
        payload.buffers_size
      );
      frame.extend_from_slice(&self.io.bc().transaction_sg.to_ne_bytes());
      _offsets_scratch = self.io.encode_transaction_sg(&mut frame, handle, code, flags, &payload);
    } else {
      trace!("< BC_TRANSACTION 0x{handle:08x} 0x{code:08x}");
      frame.extend_from_slice(&self.io.bc().transaction.to_ne_bytes());
      _offsets_scratch = self.io.encode_transaction(&mut frame, handle, code, flags, &payload);
    }

    let mut rb = ReadBuf::new();
    let mut write = IoBuf::from_slice(&frame);

    // Drive the loop until this transaction's terminal frame shows up
    let mut txstatus = loop {
      match self.write_read(Some(&mut write), &mut rb) {
        Err(e) => break Err(e),
        Ok(()) => {
          if let Some(status) = self.txstatus(reg, &mut rb, reply.as_deref_mut()) {
            break status;
          }
        }
      }
    };

    if let Ok(status) = txstatus {
      // The whole command should have been flushed on success, except that
      // positive statuses can leave a partial write behind
      debug_assert!(write.consumed == write.size || status > 0);

      // Drain whatever else the kernel already queued for this thread
      self.handle_commands(reg, None, &mut rb);
      while rb.pending() > 0 {
        if let Err(e) = self.write_read(None, &mut rb) {
          txstatus = Err(e);
          break;
        }
        self.handle_commands(reg, None, &mut rb);
      }
    }

    txstatus
  }

  /// Passive receive pump for caller-owned looper threads: one zero-write
  /// read, dispatch everything, and keep reading while a partial frame is
  /// pending.
  pub fn read(
    self: &Arc<Self>,
    reg: &dyn ObjectRegistry,
    handler: &dyn Handler
  ) -> Result<(), Errno> {
    let mut rb = ReadBuf::new();
    self.write_read(None, &mut rb)?;
    self.handle_commands(reg, Some(handler), &mut rb);
    while rb.pending() > 0 {
      self.write_read(None, &mut rb)?;
      self.handle_commands(reg, Some(handler), &mut rb);
    }
    Ok(())
  }
}

impl Drop for Driver {
  fn drop(&mut self) {
    debug!("Closing {}", self.dev);
  }
}

/// Peeks the next whole frame: opcode plus its embedded payload length.
/// None if the remaining bytes stop mid-frame.
fn next_command(bytes: &[u8]) -> Option<(u32, usize)> {
  if bytes.len() < 4 {
    return None;
  }
  let opcode = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
  let datalen = ioc_size(opcode);
  if bytes.len() < 4 + datalen {
    return None;
  }
  Some((opcode, datalen))
}

fn pending_write_bytes(buf: &IoBuf) -> &[u8] {
  if buf.remaining() == 0 {
    return &[];
  }
  // SAFETY: every write IoBuf in this module is built from a live slice
  unsafe {
    std::slice::from_raw_parts((buf.ptr + buf.consumed as u64) as usize as *const u8, buf.remaining())
  }
}

fn verbose_transaction(name: &str, tx: &TxData) {
  if !log_enabled!(Level::Trace) {
    return;
  }
  if tx.status != 0 {
    trace!("> {name} {} ({} bytes, {} objects)", tx.status, tx.size, tx.offsets.len());
  } else {
    trace!("> {name} ({} bytes, {} objects)", tx.size, tx.offsets.len());
  }
}

fn trace_dump(mark: char, bytes: &[u8]) {
  use fmt::Write as _;

  let mut mark = mark;
  for chunk in bytes.chunks(16) {
    let mut line = String::with_capacity(3 * chunk.len());
    for byte in chunk {
      let _ = write!(line, "{byte:02x} ");
    }
    trace!("{mark} {}", line.trim_end());
    mark = ' ';
  }
}

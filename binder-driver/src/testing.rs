// Scripted stand-in for the kernel side of the protocol, plus the object
// doubles the dispatch tests hang off the registry. Frames delivered by the
// script are real wire frames built with the 64-bit codec.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use binder_io::{ioc_size, BinderIo, IoBuf, TxFlag};
use enumflags2::BitFlags;
use nix::errno::Errno;

use crate::message::{LocalReply, RemoteRequest};
use crate::object::{Handler, LocalObject, ObjectRegistry, RemoteObject, TransactionSupport};
use crate::sys::{Arena, BinderSys};
use crate::Driver;

enum Step {
  /// Frames the next read-carrying write_read hands back.
  Deliver(Vec<u8>),
  /// The next write_read fails outright.
  Fail(Errno)
}

pub(crate) struct FakeSys {
  version: i32,
  script: Mutex<VecDeque<Step>>,
  written: Mutex<Vec<u8>>,
  // Boxed so payload addresses stay put
  allocs: Mutex<Vec<Box<[u8]>>>
}

impl FakeSys {
  pub fn new() -> Arc<Self> {
    Self::with_version(8)
  }

  pub fn with_version(version: i32) -> Arc<Self> {
    Arc::new(Self {
      version,
      script: Mutex::new(VecDeque::new()),
      written: Mutex::new(Vec::new()),
      allocs: Mutex::new(Vec::new())
    })
  }

  /// Queues the concatenation of `frames` as one read's worth of data.
  pub fn deliver(&self, frames: &[Vec<u8>]) {
    let bytes = frames.concat();
    self.script.lock().unwrap().push_back(Step::Deliver(bytes));
  }

  pub fn fail(&self, e: Errno) {
    self.script.lock().unwrap().push_back(Step::Fail(e));
  }

  /// Parks payload bytes at a stable address, like the kernel placing them
  /// in the arena.
  pub fn alloc(&self, bytes: &[u8]) -> u64 {
    let boxed: Box<[u8]> = bytes.into();
    let ptr = boxed.as_ptr() as u64;
    self.allocs.lock().unwrap().push(boxed);
    ptr
  }

  pub fn written(&self) -> Vec<u8> {
    self.written.lock().unwrap().clone()
  }

  pub fn script_len(&self) -> usize {
    self.script.lock().unwrap().len()
  }
}

impl BinderSys for FakeSys {
  fn open(&self, _dev: &str) -> Result<OwnedFd, Errno> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    open("/dev/null", OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
  }

  fn version(&self, _fd: BorrowedFd<'_>) -> Result<i32, Errno> {
    Ok(self.version)
  }

  fn set_max_threads(&self, _fd: BorrowedFd<'_>, _max_threads: u32) -> Result<(), Errno> {
    Ok(())
  }

  fn mmap_arena(&self, _fd: BorrowedFd<'_>, len: usize) -> Result<Arena, Errno> {
    Arena::anon(len)
  }

  fn write_read(
    &self,
    _fd: BorrowedFd<'_>,
    _io: &'static dyn BinderIo,
    write: Option<&mut IoBuf>,
    read: Option<&mut IoBuf>
  ) -> Result<(), Errno> {
    let mut script = self.script.lock().unwrap();

    if matches!(script.front(), Some(Step::Fail(_))) {
      let Some(Step::Fail(e)) = script.pop_front() else {
        unreachable!()
      };
      return Err(e);
    }

    if let Some(w) = write {
      if w.remaining() > 0 {
        let bytes = unsafe {
          std::slice::from_raw_parts((w.ptr + w.consumed as u64) as *const u8, w.remaining())
        };
        self.written.lock().unwrap().extend_from_slice(bytes);
        w.consumed = w.size;
      }
    }

    if let Some(r) = read {
      if matches!(script.front(), Some(Step::Deliver(_))) {
        let Some(Step::Deliver(bytes)) = script.pop_front() else {
          unreachable!()
        };
        assert!(bytes.len() <= r.remaining(), "scripted frames overflow the read buffer");
        unsafe {
          std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            (r.ptr + r.consumed as u64) as *mut u8,
            bytes.len()
          );
        }
        r.consumed += bytes.len();
      }
    }

    Ok(())
  }
}

pub(crate) fn driver_with(sys: &Arc<FakeSys>) -> Arc<Driver> {
  Driver::open_with(sys.clone(), "/dev/binder", 0).expect("fake open")
}

/// One wire frame: opcode plus a payload of exactly the embedded size.
pub(crate) fn frame(opcode: u32, payload: &[u8]) -> Vec<u8> {
  assert_eq!(payload.len(), ioc_size(opcode));
  let mut bytes = Vec::with_capacity(4 + payload.len());
  bytes.extend_from_slice(&opcode.to_ne_bytes());
  bytes.extend_from_slice(payload);
  bytes
}

/// A 64-bit ABI binder_transaction_data body.
pub(crate) fn tx64(
  cookie: u64,
  code: u32,
  flags: BitFlags<TxFlag>,
  data_ptr: u64,
  data_size: u64,
  offsets_ptr: u64,
  offsets_size: u64
) -> Vec<u8> {
  let mut bytes = Vec::with_capacity(64);
  bytes.extend_from_slice(&0u64.to_ne_bytes()); // target
  bytes.extend_from_slice(&cookie.to_ne_bytes());
  bytes.extend_from_slice(&code.to_ne_bytes());
  bytes.extend_from_slice(&flags.bits().to_ne_bytes());
  bytes.extend_from_slice(&1000i32.to_ne_bytes()); // sender pid
  bytes.extend_from_slice(&1000u32.to_ne_bytes()); // sender euid
  bytes.extend_from_slice(&data_size.to_ne_bytes());
  bytes.extend_from_slice(&offsets_size.to_ne_bytes());
  bytes.extend_from_slice(&data_ptr.to_ne_bytes());
  bytes.extend_from_slice(&offsets_ptr.to_ne_bytes());
  assert_eq!(bytes.len(), 64);
  bytes
}

/// Splits a written byte stream back into (opcode, payload) frames.
pub(crate) fn split_frames(mut bytes: &[u8]) -> Vec<(u32, Vec<u8>)> {
  let mut frames = Vec::new();
  while bytes.len() >= 4 {
    let opcode = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
    let datalen = ioc_size(opcode);
    assert!(bytes.len() >= 4 + datalen, "truncated frame in written stream");
    frames.push((opcode, bytes[4..4 + datalen].to_vec()));
    bytes = &bytes[4 + datalen..];
  }
  assert!(bytes.is_empty(), "trailing garbage in written stream");
  frames
}

#[derive(Default)]
pub(crate) struct TestRegistry {
  locals: Mutex<HashMap<u64, Arc<TestObject>>>,
  remotes: Mutex<HashMap<u32, Arc<TestRemote>>>
}

impl TestRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_local(&self, cookie: u64, obj: Arc<TestObject>) {
    self.locals.lock().unwrap().insert(cookie, obj);
  }

  pub fn add_remote(&self, handle: u32, obj: Arc<TestRemote>) {
    self.remotes.lock().unwrap().insert(handle, obj);
  }
}

impl ObjectRegistry for TestRegistry {
  fn get_local(&self, cookie: u64) -> Option<Arc<dyn LocalObject>> {
    self
      .locals
      .lock()
      .unwrap()
      .get(&cookie)
      .cloned()
      .map(|obj| obj as Arc<dyn LocalObject>)
  }

  fn get_remote(&self, handle: u32) -> Option<Arc<dyn RemoteObject>> {
    self
      .remotes
      .lock()
      .unwrap()
      .get(&handle)
      .cloned()
      .map(|obj| obj as Arc<dyn RemoteObject>)
  }
}

pub(crate) struct TestObject {
  pub support: TransactionSupport,
  pub reply_bytes: Option<Vec<u8>>,
  pub status: i32,
  pub increfs: AtomicUsize,
  pub decrefs: AtomicUsize,
  pub acquires: AtomicUsize,
  pub releases: AtomicUsize,
  pub seen: Mutex<Vec<(u32, Vec<u8>)>>,
  pub ifaces: Mutex<Vec<Option<String>>>
}

impl TestObject {
  pub fn new(support: TransactionSupport) -> Arc<Self> {
    Arc::new(Self {
      support,
      reply_bytes: None,
      status: 0,
      increfs: AtomicUsize::new(0),
      decrefs: AtomicUsize::new(0),
      acquires: AtomicUsize::new(0),
      releases: AtomicUsize::new(0),
      seen: Mutex::new(Vec::new()),
      ifaces: Mutex::new(Vec::new())
    })
  }

  pub fn replying(support: TransactionSupport, reply: &[u8]) -> Arc<Self> {
    let mut obj = Self::new(support);
    Arc::get_mut(&mut obj).unwrap().reply_bytes = Some(reply.to_vec());
    obj
  }
}

impl LocalObject for TestObject {
  fn handle_increfs(&self) {
    self.increfs.fetch_add(1, Ordering::SeqCst);
  }

  fn handle_decrefs(&self) {
    self.decrefs.fetch_add(1, Ordering::SeqCst);
  }

  fn handle_acquire(&self) {
    self.acquires.fetch_add(1, Ordering::SeqCst);
  }

  fn handle_release(&self) {
    self.releases.fetch_add(1, Ordering::SeqCst);
  }

  fn can_handle_transaction(&self, iface: Option<&str>, _code: u32) -> TransactionSupport {
    self.ifaces.lock().unwrap().push(iface.map(str::to_owned));
    self.support
  }

  fn handle_looper_transaction(
    &self,
    req: &mut RemoteRequest,
    code: u32,
    _flags: BitFlags<TxFlag>
  ) -> (Option<LocalReply>, i32) {
    self.seen.lock().unwrap().push((code, req.data().to_vec()));
    let reply = self.reply_bytes.as_ref().map(|bytes| {
      let mut reply = LocalReply::new();
      reply.writer().append_bytes(bytes);
      reply
    });
    (reply, self.status)
  }
}

#[derive(Default)]
pub(crate) struct TestRemote {
  pub deaths: AtomicUsize
}

impl TestRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }
}

impl RemoteObject for TestRemote {
  fn handle_death_notification(&self) {
    self.deaths.fetch_add(1, Ordering::SeqCst);
  }
}

/// Application-level dispatch double.
#[derive(Default)]
pub(crate) struct TestHandler {
  pub reply_bytes: Option<Vec<u8>>,
  pub status: i32,
  pub seen: Mutex<Vec<u32>>
}

impl Handler for TestHandler {
  fn transact(
    &self,
    _obj: &Arc<dyn LocalObject>,
    _req: &mut RemoteRequest,
    code: u32,
    _flags: BitFlags<TxFlag>
  ) -> (Option<LocalReply>, i32) {
    self.seen.lock().unwrap().push(code);
    let reply = self.reply_bytes.as_ref().map(|bytes| {
      let mut reply = LocalReply::new();
      reply.writer().append_bytes(bytes);
      reply
    });
    (reply, self.status)
  }
}

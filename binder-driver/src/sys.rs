// Kernel-facing seam. Everything the engine wants from the OS goes through
// the BinderSys trait so the command loop can be exercised against a
// scripted stand-in instead of /dev/binder.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use binder_io::{BinderIo, IoBuf, Version};
use log::warn;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::{ioctl_readwrite, ioctl_write_ptr};

const BINDER_IOC_MAGIC: u8 = b'b';

ioctl_write_ptr!(ioctl_set_max_threads, BINDER_IOC_MAGIC, 5, u32);
ioctl_readwrite!(ioctl_version, BINDER_IOC_MAGIC, 9, Version);

/// The mmap region the kernel copies inbound transaction payloads into.
/// Unmapped on drop.
pub struct Arena {
  base: NonNull<c_void>,
  len: usize
}

// The arena is written only by the kernel and read through raw pointers
// carried in decoded frames
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  pub(crate) fn map(fd: BorrowedFd<'_>, len: usize) -> Result<Self, Errno> {
    let len_nz = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
    let base = unsafe {
      mmap(
        None,
        len_nz,
        ProtFlags::PROT_READ,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
        fd,
        0
      )
    }?;
    Ok(Self { base, len })
  }

  /// Anonymous read+write mapping standing in for the kernel arena in
  /// tests; the fake kernel copies payloads into it.
  #[cfg(test)]
  pub(crate) fn anon(len: usize) -> Result<Self, Errno> {
    use nix::sys::mman::mmap_anonymous;
    let len_nz = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
    let base = unsafe {
      mmap_anonymous(
        None,
        len_nz,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE
      )
    }?;
    Ok(Self { base, len })
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn base(&self) -> *mut u8 {
    self.base.as_ptr().cast()
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    // SAFETY: the mapping is exclusively owned and no longer referenced
    if let Err(e) = unsafe { munmap(self.base, self.len) } {
      warn!("munmap failed: {e}");
    }
  }
}

/// The handful of kernel operations the driver engine needs.
pub trait BinderSys: Send + Sync {
  fn open(&self, dev: &str) -> Result<OwnedFd, Errno>;
  fn version(&self, fd: BorrowedFd<'_>) -> Result<i32, Errno>;
  /// Best effort; the session logs failures and carries on.
  fn set_max_threads(&self, fd: BorrowedFd<'_>, max_threads: u32) -> Result<(), Errno>;
  fn mmap_arena(&self, fd: BorrowedFd<'_>, len: usize) -> Result<Arena, Errno>;
  fn write_read(
    &self,
    fd: BorrowedFd<'_>,
    io: &'static dyn BinderIo,
    write: Option<&mut IoBuf>,
    read: Option<&mut IoBuf>
  ) -> Result<(), Errno>;
}

/// The real thing.
pub struct KernelSys;

impl BinderSys for KernelSys {
  fn open(&self, dev: &str) -> Result<OwnedFd, Errno> {
    open(dev, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
  }

  fn version(&self, fd: BorrowedFd<'_>) -> Result<i32, Errno> {
    use std::os::fd::AsRawFd;
    let mut version = Version { version: 0 };
    unsafe { ioctl_version(fd.as_raw_fd(), &mut version) }?;
    Ok(version.version)
  }

  fn set_max_threads(&self, fd: BorrowedFd<'_>, max_threads: u32) -> Result<(), Errno> {
    use std::os::fd::AsRawFd;
    unsafe { ioctl_set_max_threads(fd.as_raw_fd(), &max_threads) }?;
    Ok(())
  }

  fn mmap_arena(&self, fd: BorrowedFd<'_>, len: usize) -> Result<Arena, Errno> {
    Arena::map(fd, len)
  }

  fn write_read(
    &self,
    fd: BorrowedFd<'_>,
    io: &'static dyn BinderIo,
    write: Option<&mut IoBuf>,
    read: Option<&mut IoBuf>
  ) -> Result<(), Errno> {
    io.write_read(fd, write, read)
  }
}

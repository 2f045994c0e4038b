// Driver engine for the binder character device: owns the open handle and
// the receive arena, speaks the BC_*/BR_* command protocol over the fused
// write_read ioctl, and runs the transactional command loop that dispatches
// inbound traffic to the object registry while a reply is awaited.
//
// The engine spawns no threads. Callers drive it: `transact` for outgoing
// calls, `read` as the receive pump on caller-owned looper threads, `poll`
// to wait for readiness.

mod buffer;
mod driver;
mod message;
mod object;
mod protocol;
mod readbuf;
mod sys;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::Buffer;
pub use driver::{Driver, OpenError};
pub use message::{LocalReply, LocalRequest, RemoteReply, RemoteRequest, Writer};
pub use object::{Handler, LocalObject, ObjectRegistry, RemoteObject, TransactionSupport};
pub use protocol::{protocol_for_device, RpcProtocol, PROTOCOL_AIDL, PROTOCOL_HIDL};
pub use sys::{Arena, BinderSys, KernelSys};

// Transaction statuses as seen by `transact` callers. Zero and positive
// values are transaction-level statuses; driver-level failures travel as
// `Err(Errno)` instead.
pub const STATUS_OK: i32 = 0;
pub const STATUS_FAILED: i32 = 1;
pub const STATUS_DEAD_OBJECT: i32 = 2;

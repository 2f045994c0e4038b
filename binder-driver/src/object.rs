// Collaborator seams. The engine resolves frame targets through an
// ObjectRegistry and hands the work to whatever lives behind these traits;
// it holds no object state of its own.

use std::sync::Arc;

use binder_io::TxFlag;
use enumflags2::BitFlags;

use crate::message::{LocalReply, RemoteRequest};

/// A local object's answer to "can you take this transaction?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSupport {
  /// Not recognized; the sender gets a bad-message status back.
  None,
  /// Handled inline on the thread driving the command loop.
  Looper,
  /// Handed to the application-level Handler.
  Application
}

/// An object hosted by this process, addressed by cookie in inbound frames.
pub trait LocalObject: Send + Sync {
  fn handle_increfs(&self);
  fn handle_decrefs(&self);
  fn handle_acquire(&self);
  fn handle_release(&self);

  fn can_handle_transaction(&self, iface: Option<&str>, code: u32) -> TransactionSupport;

  /// Inline dispatch for `TransactionSupport::Looper` answers. Returns the
  /// reply to send (if any) and the status used when there is none.
  fn handle_looper_transaction(
    &self,
    req: &mut RemoteRequest,
    code: u32,
    flags: BitFlags<TxFlag>
  ) -> (Option<LocalReply>, i32);
}

/// A proxy for an object hosted elsewhere, addressed by kernel handle.
pub trait RemoteObject: Send + Sync {
  fn handle_death_notification(&self);
}

/// Application-side dispatch for `TransactionSupport::Application` answers.
pub trait Handler: Send + Sync {
  fn transact(
    &self,
    obj: &Arc<dyn LocalObject>,
    req: &mut RemoteRequest,
    code: u32,
    flags: BitFlags<TxFlag>
  ) -> (Option<LocalReply>, i32);
}

/// Lookups the command loop performs while decoding frames.
pub trait ObjectRegistry: Send + Sync {
  fn get_local(&self, cookie: u64) -> Option<Arc<dyn LocalObject>>;
  fn get_remote(&self, handle: u32) -> Option<Arc<dyn RemoteObject>>;
}

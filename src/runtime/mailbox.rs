// src/runtime/mailbox.rs

//! Type aliases for the broker's command channel based on `async-channel`.

use crate::runtime::command::Command;

/// The sending end of the broker's mailbox. Cloneable; transport drivers,
/// proxies, and API handles all feed the same channel.
pub type MailboxSender = async_channel::Sender<Command>;

/// The receiving end. Owned by the broker task; commands are processed
/// strictly one at a time.
pub type MailboxReceiver = async_channel::Receiver<Command>;

/// Creates a bounded mailbox channel pair.
pub fn mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
  async_channel::bounded(capacity.max(1))
}

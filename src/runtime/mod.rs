// src/runtime/mod.rs

//! Core asynchronous runtime primitives: the broker command enum and its
//! mailbox channel aliases.

pub mod command;
pub mod mailbox;

pub use command::Command;
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender};

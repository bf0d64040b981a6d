// src/transport/mod.rs

//! Transport drivers feeding broker mailboxes.
//!
//! The broker consumes only the [`Backend`](crate::backend::Backend) seam;
//! these modules provide the two drivers shipped with the crate: an
//! in-process loopback network (used heavily by the test suite) and a Tokio
//! TCP driver.

pub mod loopback;
pub mod tcp;

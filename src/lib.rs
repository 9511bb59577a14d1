//! Spam pipeline — staged concurrency over bounded queues.
//!
//! Raw user identifiers go in; `"<is_spam> <message_id>"` lines come out,
//! spam first, then by ascending message id.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod services;

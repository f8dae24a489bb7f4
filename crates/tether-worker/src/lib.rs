//! Worker-backed transport: sessions live on a dedicated thread and the
//! host talks to them through a message channel.
//!
//! The worker thread owns every session's handle; the host side holds
//! only a session id and a channel sender, making [`WorkerBindings`] a
//! stateless shape-translator. Worker shutdown or death resolves every
//! outstanding caller with a transport error instead of hanging it.

mod protocol;
mod worker;

pub use protocol::SessionId;
pub use worker::{Worker, WorkerBindings};

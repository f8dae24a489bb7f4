//! Request envelopes crossing the host ↔ worker channel.
//!
//! Unlike the in-process transport, the handle is implicit: every request
//! names its session explicitly and the worker maps it to the handle it
//! owns. Replies travel on per-request oneshot channels; binary payloads
//! cross as base64 strings.

use tether::error::Result;
use tether::wire::{RawProgress, RawRunResult};
use tokio::sync::oneshot;

/// Identifies one session on the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

pub(crate) enum Request {
    Init {
        session: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Run {
        session: SessionId,
        code: String,
        limits_json: Option<String>,
        script_name: Option<String>,
        reply: oneshot::Sender<Result<RawRunResult>>,
    },
    Start {
        session: SessionId,
        code: String,
        externals_json: Option<String>,
        limits_json: Option<String>,
        script_name: Option<String>,
        reply: oneshot::Sender<Result<RawProgress>>,
    },
    Resume {
        session: SessionId,
        value_json: String,
        reply: oneshot::Sender<Result<RawProgress>>,
    },
    ResumeWithError {
        session: SessionId,
        message: String,
        reply: oneshot::Sender<Result<RawProgress>>,
    },
    ResumeAsFuture {
        session: SessionId,
        reply: oneshot::Sender<Result<RawProgress>>,
    },
    ResolveFutures {
        session: SessionId,
        results_json: String,
        errors_json: String,
        reply: oneshot::Sender<Result<RawProgress>>,
    },
    RearmTimeLimit {
        session: SessionId,
        budget_ms: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        session: SessionId,
        reply: oneshot::Sender<Result<String>>,
    },
    Restore {
        session: SessionId,
        data_b64: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Dispose {
        session: SessionId,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

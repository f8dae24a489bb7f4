use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use tether::bindings::{CoreBindings, FutureBindings, SnapshotBindings};
use tether::error::{Error, Result};
use tether::wire::{RawProgress, RawRunResult, RawState};
use tether_native::{Engine, NativeBindings};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{Request, SessionId};

const QUEUE_DEPTH: usize = 64;

/// Owner of the worker thread. Sessions are created through
/// [`Worker::bindings`]; the thread keeps serving until [`Worker::shutdown`]
/// or until the last sender is gone.
pub struct Worker {
    tx: mpsc::Sender<Request>,
    next_session: Arc<Mutex<u64>>,
}

impl Worker {
    /// Start a worker thread serving sessions of the given engine.
    pub fn spawn<E: Engine>() -> Result<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("tether-worker".to_string())
            .spawn(move || serve::<E>(rx))
            .map_err(|e| Error::Transport(format!("failed to spawn worker thread: {e}")))?;
        Ok(Self {
            tx,
            next_session: Arc::new(Mutex::new(0)),
        })
    }

    /// Bindings for a fresh session on this worker.
    #[must_use]
    pub fn bindings(&self) -> WorkerBindings {
        let mut next = self.next_session.lock();
        let session = SessionId(*next);
        *next += 1;
        WorkerBindings {
            session,
            tx: self.tx.clone(),
        }
    }

    /// Stop the worker thread. Everything still queued, and every later
    /// request, resolves with a transport error.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }
}

fn serve<E: Engine>(mut rx: mpsc::Receiver<Request>) {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!(error = %e, "worker runtime unavailable");
            return;
        }
    };
    let mut sessions: HashMap<SessionId, NativeBindings<E>> = HashMap::new();

    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Shutdown => break,
            Request::Init { session, reply } => {
                sessions.entry(session).or_insert_with(NativeBindings::new);
                let _ = reply.send(Ok(()));
            }
            Request::Run {
                session,
                code,
                limits_json,
                script_name,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => rt.block_on(bindings.run(
                        &code,
                        limits_json.as_deref(),
                        script_name.as_deref(),
                    )),
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::Start {
                session,
                code,
                externals_json,
                limits_json,
                script_name,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => rt.block_on(bindings.start(
                        &code,
                        externals_json.as_deref(),
                        limits_json.as_deref(),
                        script_name.as_deref(),
                    )),
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::Resume {
                session,
                value_json,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => rt.block_on(bindings.resume(&value_json)),
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::ResumeWithError {
                session,
                message,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => rt.block_on(bindings.resume_with_error(&message)),
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::ResumeAsFuture { session, reply } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => rt.block_on(bindings.resume_as_future()),
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::ResolveFutures {
                session,
                results_json,
                errors_json,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => {
                        rt.block_on(bindings.resolve_futures(&results_json, &errors_json))
                    }
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::RearmTimeLimit {
                session,
                budget_ms,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => rt.block_on(bindings.rearm_time_limit(budget_ms)),
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::Snapshot { session, reply } => {
                let result = match sessions.get_mut(&session) {
                    Some(bindings) => {
                        rt.block_on(bindings.snapshot()).map(|bytes| BASE64.encode(bytes))
                    }
                    None => Err(unknown(session)),
                };
                let _ = reply.send(result);
            }
            Request::Restore {
                session,
                data_b64,
                reply,
            } => {
                let result = match BASE64.decode(data_b64.as_bytes()) {
                    Err(e) => Err(Error::Transport(format!("invalid snapshot encoding: {e}"))),
                    Ok(bytes) => match sessions.get_mut(&session) {
                        Some(bindings) => rt.block_on(bindings.restore(&bytes)),
                        None => Err(unknown(session)),
                    },
                };
                let _ = reply.send(result);
            }
            Request::Dispose { session, reply } => {
                if let Some(mut bindings) = sessions.remove(&session) {
                    rt.block_on(bindings.dispose());
                }
                let _ = reply.send(());
            }
        }
    }
    debug!(sessions = sessions.len(), "worker stopped");
}

fn unknown(session: SessionId) -> Error {
    Error::Transport(format!("unknown {session}"))
}

fn worker_gone() -> Error {
    Error::Transport("worker terminated".to_string())
}

/// One session's view of the worker: a session id plus a channel sender.
/// Pure shape translation; it holds no execution state of its own.
pub struct WorkerBindings {
    session: SessionId,
    tx: mpsc::Sender<Request>,
}

impl WorkerBindings {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request + Send,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| worker_gone())?;
        reply_rx.await.map_err(|_| worker_gone())?
    }
}

/// The native side reports usage on every completion; the worker wire may
/// legitimately omit it, so the host side synthesizes a zero-filled value
/// rather than leaving the field absent.
fn fill_usage(mut progress: RawProgress) -> RawProgress {
    if progress.state == RawState::Complete {
        progress.usage.get_or_insert_with(Default::default);
    }
    progress
}

#[async_trait]
impl CoreBindings for WorkerBindings {
    async fn init(&mut self) -> Result<()> {
        let session = self.session;
        self.request(|reply| Request::Init { session, reply }).await
    }

    async fn run(
        &mut self,
        code: &str,
        limits_json: Option<&str>,
        script_name: Option<&str>,
    ) -> Result<RawRunResult> {
        let session = self.session;
        let code = code.to_string();
        let limits_json = limits_json.map(str::to_string);
        let script_name = script_name.map(str::to_string);
        let mut result = self
            .request(move |reply| Request::Run {
                session,
                code,
                limits_json,
                script_name,
                reply,
            })
            .await?;
        result.usage.get_or_insert_with(Default::default);
        Ok(result)
    }

    async fn start(
        &mut self,
        code: &str,
        externals_json: Option<&str>,
        limits_json: Option<&str>,
        script_name: Option<&str>,
    ) -> Result<RawProgress> {
        let session = self.session;
        let code = code.to_string();
        let externals_json = externals_json.map(str::to_string);
        let limits_json = limits_json.map(str::to_string);
        let script_name = script_name.map(str::to_string);
        self.request(move |reply| Request::Start {
            session,
            code,
            externals_json,
            limits_json,
            script_name,
            reply,
        })
        .await
        .map(fill_usage)
    }

    async fn resume(&mut self, value_json: &str) -> Result<RawProgress> {
        let session = self.session;
        let value_json = value_json.to_string();
        self.request(move |reply| Request::Resume {
            session,
            value_json,
            reply,
        })
        .await
        .map(fill_usage)
    }

    async fn resume_with_error(&mut self, message: &str) -> Result<RawProgress> {
        let session = self.session;
        let message = message.to_string();
        self.request(move |reply| Request::ResumeWithError {
            session,
            message,
            reply,
        })
        .await
        .map(fill_usage)
    }

    async fn rearm_time_limit(&mut self, budget_ms: u64) -> Result<()> {
        let session = self.session;
        self.request(move |reply| Request::RearmTimeLimit {
            session,
            budget_ms,
            reply,
        })
        .await
    }

    async fn dispose(&mut self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Request::Dispose {
                session: self.session,
                reply: reply_tx,
            })
            .await;
        if sent.is_ok() {
            // A dead worker has already released the session.
            let _ = reply_rx.await;
        }
    }
}

impl Drop for WorkerBindings {
    fn drop(&mut self) {
        // Best effort: the worker's table entry must not outlive the last
        // handle to it. A second Dispose for an already-released session
        // is a no-op on the worker side.
        let (reply, _) = oneshot::channel();
        let _ = self.tx.try_send(Request::Dispose {
            session: self.session,
            reply,
        });
    }
}

#[async_trait]
impl SnapshotBindings for WorkerBindings {
    async fn snapshot(&mut self) -> Result<Vec<u8>> {
        let session = self.session;
        let encoded = self
            .request(move |reply| Request::Snapshot { session, reply })
            .await?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| Error::Transport(format!("invalid snapshot encoding: {e}")))
    }

    async fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let session = self.session;
        let data_b64 = BASE64.encode(bytes);
        self.request(move |reply| Request::Restore {
            session,
            data_b64,
            reply,
        })
        .await
    }
}

#[async_trait]
impl FutureBindings for WorkerBindings {
    async fn resume_as_future(&mut self) -> Result<RawProgress> {
        let session = self.session;
        self.request(move |reply| Request::ResumeAsFuture { session, reply })
            .await
            .map(fill_usage)
    }

    async fn resolve_futures(
        &mut self,
        results_json: &str,
        errors_json: &str,
    ) -> Result<RawProgress> {
        let session = self.session;
        let results_json = results_json.to_string();
        let errors_json = errors_json.to_string();
        self.request(move |reply| Request::ResolveFutures {
            session,
            results_json,
            errors_json,
            reply,
        })
        .await
        .map(fill_usage)
    }
}

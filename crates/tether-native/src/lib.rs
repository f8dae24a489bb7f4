//! In-process transport for the host platform: a handle-based lifecycle
//! around a pluggable script [`Engine`], with panic containment at every
//! entry point.

pub mod adapter;
pub mod boundary;
pub mod handle;
pub mod vm;

pub use adapter::NativeBindings;
pub use handle::Handle;
pub use vm::{Engine, HostOutcome, Metered, Phase, PrintSink, TrackerKind, TrackerPolicy, Unmetered};

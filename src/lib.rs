//! File-integrity event processing.
//!
//! This crate turns the raw stream of kernel-probe records produced by a
//! kprobe decoder into a clean, de-duplicated stream of high-level
//! file-system change events (create / modify / attribute change / move /
//! delete), scoped to a set of monitored directory subtrees.
//!
//! The heart of it is the [`dentry::DEntryCache`], a live mirror of the
//! monitored subtrees rebuilt from inode-keyed records: it resolves every
//! event to an absolute path, pairs the two halves of a rename through
//! the originating task id, and applies the recursion policy. The
//! [`processor::EventProcessor`] drives it: one task drains the probe
//! queue in order, mutates the cache and hands finished events to the
//! [`Emitter`].
//!
//! Collaborators are held behind capability traits:
//! - the [`Emitter`] forwards high-level events downstream;
//! - the [`PathTraverser`] seeds and walks monitored subtrees on its own
//!   workers, reporting results as `Monitor` records pushed through the
//!   same queue the decoder feeds.
//!
//! [`processor::start_event_processor`] wires the pieces up on a tokio
//! task; [`event::ProbeEventPool`] is the allocation-free lane between
//! the decoder and the processor.

pub mod config;
pub mod dentry;
pub mod emitter;
pub mod event;
pub mod processor;
pub mod shutdown;
pub mod traverser;

pub use config::{ConfigError, MonitorConfig, RawConfig};
pub use emitter::{Emitter, EmitterError, FileOp};
pub use event::{DKey, PooledEvent, ProbeEvent, ProbeEventPool, ProbeOp};
pub use processor::{start_event_processor, EventProcessor, ProcessError};
pub use shutdown::{CleanExit, ShutdownSender, ShutdownSignal};
pub use traverser::{MonitorPath, PathTraverser, TraverserError};

pub use nix::unistd::Pid;

/// Utility function to pretty print an error with its sources.
///
/// By default Rust won't print the source chain of an error, making the
/// message much less useful. Instead of re-implementing that, anyhow is
/// used as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

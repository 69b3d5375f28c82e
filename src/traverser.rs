//! Contract toward the asynchronous directory walker.
//!
//! The traverser enumerates monitored subtrees on its own workers and
//! reports what it finds as `Monitor` probe records pushed through the
//! same queue the kernel decoder feeds. It never touches the cache
//! directly.

use std::future::Future;

use nix::unistd::Pid;

use crate::event::DKey;

/// Errors returned by traverser implementations.
pub type TraverserError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Canonical location of an object a walk reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorPath {
    pub full_path: String,
    /// Hops from the monitored root the walk started at.
    pub depth: u32,
    /// Task the walk was scheduled for.
    pub tid: Pid,
    /// Set when the walk completes a `MoveTo` whose destination was
    /// unknown to the cache.
    pub is_from_move: bool,
}

pub trait PathTraverser: Send {
    /// Register a subtree root. The walker eventually reports the root
    /// (and, with recursion, everything below it) as monitor records.
    fn add_path_to_monitor(
        &mut self,
        path: &str,
    ) -> impl Future<Output = Result<(), TraverserError>> + Send;

    /// Enumerate a subtree the cache has never seen. Discovered entries
    /// come back as monitor records flagged `is_from_move` and tagged
    /// with `tid`.
    fn walk_async(&mut self, path: &str, depth: u32, tid: Pid) -> impl Future<Output = ()> + Send;

    /// Confirm that a monitor record corresponds to a registered subtree,
    /// handing back its canonical location. `None` means the record is
    /// stale and must be ignored.
    fn get_monitor_path(
        &mut self,
        key: DKey,
        name: &str,
    ) -> impl Future<Output = Option<MonitorPath>> + Send;
}

//! The event processor: applies probe records to the directory-entry
//! cache and emits high-level change events.
//!
//! One processor task owns the cache and drains the probe-event queue in
//! order. The kernel decoder and the path traverser both feed that
//! queue; the traverser's monitor records are how asynchronous walks are
//! serialized with live kernel events.

use std::time::{Duration, Instant};

use nix::unistd::Pid;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::MonitorConfig,
    dentry::{join_path, DEntry, DEntryCache},
    emitter::{Emitter, EmitterError, FileOp},
    event::{PooledEvent, ProbeEvent, ProbeOp},
    shutdown::{CleanExit, ShutdownSender, ShutdownSignal},
    traverser::{PathTraverser, TraverserError},
};

/// How long a staged `MoveFrom` may wait for its `MoveTo` before the
/// subtree is dropped.
const MOVE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often staged moves are checked for expiry.
const MOVE_GC_PERIOD: Duration = Duration::from_secs(5);

/// Queue depth between the producers and the processor.
const EVENT_QUEUE_DEPTH: usize = 1000;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unknown event type (mask {mask:#x})")]
    UnknownEventType { mask: u32 },
    #[error("emitting event: {0}")]
    Emit(EmitterError),
    #[error("registering monitored path {path}: {err}")]
    RegisterPath { path: String, err: TraverserError },
}

pub struct EventProcessor<T, E> {
    traverser: T,
    emitter: E,
    cache: DEntryCache,
    monitored_paths: Vec<String>,
    recursive: bool,
    next_move_gc: Instant,
}

impl<T: PathTraverser, E: Emitter> EventProcessor<T, E> {
    pub fn new(traverser: T, emitter: E, config: &MonitorConfig) -> Self {
        Self {
            traverser,
            emitter,
            cache: DEntryCache::new(),
            monitored_paths: config.monitored_paths.clone(),
            recursive: config.recursive,
            next_move_gc: Instant::now() + MOVE_GC_PERIOD,
        }
    }

    /// Apply one probe record. The record goes back to its pool when `pe`
    /// drops, on every path out of here.
    ///
    /// Records for objects outside the monitored subtrees are ignored; a
    /// record with no recognized mask fails with
    /// [`ProcessError::UnknownEventType`]. An emitter failure is returned
    /// to the caller with the preceding cache mutation kept in place, so
    /// a replay cannot double-insert.
    pub async fn process(&mut self, pe: PooledEvent) -> Result<(), ProcessError> {
        let op = ProbeOp::from_mask(pe.mask).ok_or(ProcessError::UnknownEventType { mask: pe.mask })?;
        match op {
            ProbeOp::Monitor => self.on_monitor(&pe).await,
            ProbeOp::Create => self.on_create(&pe).await,
            ProbeOp::Modify => self.on_touch(&pe, FileOp::Modify).await,
            ProbeOp::Attrib => self.on_touch(&pe, FileOp::Attrib).await,
            ProbeOp::MoveFrom => self.on_move_from(&pe).await,
            ProbeOp::MoveTo => self.on_move_to(&pe).await,
            ProbeOp::Delete => self.on_delete(&pe).await,
        }
    }

    /// Drain the queue until the producers hang up or shutdown is
    /// requested. Unknown records are logged and skipped; an emitter
    /// failure stops the loop and surfaces to the caller.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<PooledEvent>,
        mut shutdown: ShutdownSignal,
    ) -> Result<CleanExit, ProcessError> {
        for path in std::mem::take(&mut self.monitored_paths) {
            if let Err(err) = self.traverser.add_path_to_monitor(&path).await {
                return Err(ProcessError::RegisterPath { path, err });
            }
        }
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(pe) => {
                        match self.process(pe).await {
                            Ok(()) => {}
                            Err(err @ ProcessError::UnknownEventType { .. }) => {
                                crate::log_error("dropping probe record", err);
                            }
                            Err(err) => return Err(err),
                        }
                        self.maybe_expire_moves();
                    }
                    None => return Ok(CleanExit::new()),
                },
                exit = shutdown.recv() => return Ok(exit),
            }
        }
    }

    /// Monitor records only come from the traverser's own walks, either
    /// seeding a registered root or reporting a subtree discovered to
    /// complete a move.
    async fn on_monitor(&mut self, pe: &ProbeEvent) -> Result<(), ProcessError> {
        let Some(monitor_path) = self
            .traverser
            .get_monitor_path(pe.file_key(), &pe.file_name)
            .await
        else {
            return Ok(());
        };

        let key = pe.file_key();
        match self.cache.get(&pe.parent_key()) {
            Some(parent) => {
                let parent_key = parent.key();
                if self.cache.get(&key).is_none() {
                    self.cache.add(DEntry::new(&pe.file_name, key), Some(parent_key));
                }
            }
            None => {
                let entry = DEntry::root(&monitor_path.full_path, key, monitor_path.depth);
                self.cache.add(entry, None);
            }
        }

        if !monitor_path.is_from_move {
            return Ok(());
        }

        // the walk that produced this record is the second half of a
        // rename whose destination was unknown
        let Some(path) = self.cache.get(&key).map(|entry| self.cache.path_of(entry)) else {
            return Ok(());
        };
        self.emit(&path, monitor_path.tid, FileOp::MovedTo).await
    }

    async fn on_create(&mut self, pe: &ProbeEvent) -> Result<(), ProcessError> {
        let Some(parent) = self.lookup_parent(pe) else {
            return Ok(());
        };
        let parent_key = parent.key();
        self.cache
            .add(DEntry::new(&pe.file_name, pe.file_key()), Some(parent_key));
        let Some(path) = self
            .cache
            .get(&pe.file_key())
            .map(|entry| self.cache.path_of(entry))
        else {
            return Ok(());
        };
        self.emit(&path, pe.tid, FileOp::Create).await
    }

    async fn on_touch(&mut self, pe: &ProbeEvent, op: FileOp) -> Result<(), ProcessError> {
        let Some(entry) = self.cache.get(&pe.file_key()) else {
            return Ok(());
        };
        let path = self.cache.path_of(entry);
        self.emit(&path, pe.tid, op).await
    }

    async fn on_move_from(&mut self, pe: &ProbeEvent) -> Result<(), ProcessError> {
        let Some(parent) = self.lookup_parent(pe) else {
            // an unmonitored source must not leave a stale staging slot:
            // a later MoveTo of this task is a fresh arrival
            self.cache.move_clear(pe.tid);
            return Ok(());
        };
        let Some(child) = self.cache.child_of(parent, &pe.file_name) else {
            return Ok(());
        };
        let key = child.key();
        let path = self.cache.path_of(child);
        self.cache.move_from(pe.tid, key);
        self.emit(&path, pe.tid, FileOp::MovedFrom).await
    }

    async fn on_move_to(&mut self, pe: &ProbeEvent) -> Result<(), ProcessError> {
        let Some(parent) = self.lookup_parent(pe) else {
            self.cache.move_clear(pe.tid);
            return Ok(());
        };
        let parent_key = parent.key();
        let parent_depth = parent.depth();
        let parent_path = self.cache.path_of(parent);

        if let Some(new_path) = self.cache.move_to(pe.tid, parent_key, &pe.file_name) {
            return self.emit(&new_path, pe.tid, FileOp::MovedTo).await;
        }

        // unknown source: the destination subtree has to be discovered
        // with a fresh walk, which reports it back as monitor records
        let new_path = join_path(&parent_path, &pe.file_name);
        log::debug!("scheduling walk of {new_path} for task {}", pe.tid);
        self.traverser
            .walk_async(&new_path, parent_depth + 1, pe.tid)
            .await;
        Ok(())
    }

    async fn on_delete(&mut self, pe: &ProbeEvent) -> Result<(), ProcessError> {
        let Some(parent) = self.lookup_parent(pe) else {
            return Ok(());
        };
        let Some(child) = self.cache.child_of(parent, &pe.file_name) else {
            return Ok(());
        };
        let key = child.key();
        let path = self.cache.path_of(child);
        self.cache.remove(key);
        self.emit(&path, pe.tid, FileOp::Delete).await
    }

    /// Parent lookup combined with the recursion gate: with recursion
    /// off, only the immediate children of a monitored root generate
    /// events.
    fn lookup_parent(&self, pe: &ProbeEvent) -> Option<&DEntry> {
        let parent = self.cache.get(&pe.parent_key())?;
        if parent.depth() >= 1 && !self.recursive {
            return None;
        }
        Some(parent)
    }

    async fn emit(&mut self, path: &str, tid: Pid, op: FileOp) -> Result<(), ProcessError> {
        log::trace!(target: "event::fs", "{op} {path} [{tid}]");
        self.emitter
            .emit(path, tid, op)
            .await
            .map_err(ProcessError::Emit)
    }

    fn maybe_expire_moves(&mut self) {
        let now = Instant::now();
        if now < self.next_move_gc {
            return;
        }
        log::trace!("periodic staged-move expiry");
        self.cache.expire_staged_moves(MOVE_TIMEOUT);
        self.next_move_gc = now + MOVE_GC_PERIOD;
    }
}

/// Spawn the processor on its own task.
///
/// Probe records pushed through the returned sender are processed in
/// order. The traverser should be handed a clone of the sender so the
/// monitor records its walks synthesize flow through the same queue.
pub fn start_event_processor<T, E>(
    traverser: T,
    emitter: E,
    config: MonitorConfig,
) -> (
    mpsc::Sender<PooledEvent>,
    ShutdownSender,
    JoinHandle<Result<CleanExit, ProcessError>>,
)
where
    T: PathTraverser + 'static,
    E: Emitter + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = ShutdownSignal::new();
    let processor = EventProcessor::new(traverser, emitter, &config);
    let handle = tokio::spawn(processor.run(rx, shutdown_rx));
    (tx, shutdown_tx, handle)
}

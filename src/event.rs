//! Probe records and their pool.
//!
//! A [`ProbeEvent`] is one kernel observation, decoded from a kprobe
//! record. Events are pooled: the decoder acquires one, fills it in and
//! sends it down the processor queue; the [`PooledEvent`] guard returns
//! it to the pool when dropped, whatever path the processor takes.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

use nix::unistd::Pid;

/// Identity of a filesystem object: inode plus the device it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DKey {
    pub ino: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
}

pub const MASK_MONITOR: u32 = 1 << 0;
pub const MASK_CREATE: u32 = 1 << 1;
pub const MASK_MODIFY: u32 = 1 << 2;
pub const MASK_ATTRIB: u32 = 1 << 3;
pub const MASK_MOVE_FROM: u32 = 1 << 4;
pub const MASK_MOVE_TO: u32 = 1 << 5;
pub const MASK_DELETE: u32 = 1 << 6;

/// Operation described by a probe record. A record is well formed only
/// when exactly one mask bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOp {
    /// Synthesized by the path traverser for entries of a walked subtree.
    Monitor,
    Create,
    Modify,
    Attrib,
    MoveFrom,
    MoveTo,
    Delete,
}

impl ProbeOp {
    /// Decode a raw mask. `None` unless exactly one recognized bit is set.
    pub fn from_mask(mask: u32) -> Option<Self> {
        match mask {
            MASK_MONITOR => Some(ProbeOp::Monitor),
            MASK_CREATE => Some(ProbeOp::Create),
            MASK_MODIFY => Some(ProbeOp::Modify),
            MASK_ATTRIB => Some(ProbeOp::Attrib),
            MASK_MOVE_FROM => Some(ProbeOp::MoveFrom),
            MASK_MOVE_TO => Some(ProbeOp::MoveTo),
            MASK_DELETE => Some(ProbeOp::Delete),
            _ => None,
        }
    }

    pub fn mask(&self) -> u32 {
        match self {
            ProbeOp::Monitor => MASK_MONITOR,
            ProbeOp::Create => MASK_CREATE,
            ProbeOp::Modify => MASK_MODIFY,
            ProbeOp::Attrib => MASK_ATTRIB,
            ProbeOp::MoveFrom => MASK_MOVE_FROM,
            ProbeOp::MoveTo => MASK_MOVE_TO,
            ProbeOp::Delete => MASK_DELETE,
        }
    }
}

/// One kernel observation, as filled in by the probe decoder.
///
/// `file_*` identifies the subject, `parent_*` its parent directory at
/// event time. `tid` is the originating kernel task, the correlation key
/// between the two halves of a rename.
#[derive(Debug)]
pub struct ProbeEvent {
    pub mask: u32,
    pub file_name: String,
    pub file_ino: u64,
    pub file_dev_major: u32,
    pub file_dev_minor: u32,
    pub parent_ino: u64,
    pub parent_dev_major: u32,
    pub parent_dev_minor: u32,
    pub tid: Pid,
}

impl Default for ProbeEvent {
    fn default() -> Self {
        Self {
            mask: 0,
            file_name: String::new(),
            file_ino: 0,
            file_dev_major: 0,
            file_dev_minor: 0,
            parent_ino: 0,
            parent_dev_major: 0,
            parent_dev_minor: 0,
            tid: Pid::from_raw(0),
        }
    }
}

impl ProbeEvent {
    pub fn op(&self) -> Option<ProbeOp> {
        ProbeOp::from_mask(self.mask)
    }

    pub fn file_key(&self) -> DKey {
        DKey {
            ino: self.file_ino,
            dev_major: self.file_dev_major,
            dev_minor: self.file_dev_minor,
        }
    }

    pub fn parent_key(&self) -> DKey {
        DKey {
            ino: self.parent_ino,
            dev_major: self.parent_dev_major,
            dev_minor: self.parent_dev_minor,
        }
    }

    fn clear(&mut self) {
        // keep the name allocation for reuse
        self.file_name.clear();
        self.mask = 0;
        self.file_ino = 0;
        self.file_dev_major = 0;
        self.file_dev_minor = 0;
        self.parent_ino = 0;
        self.parent_dev_major = 0;
        self.parent_dev_minor = 0;
        self.tid = Pid::from_raw(0);
    }
}

type FreeList = Arc<Mutex<Vec<Box<ProbeEvent>>>>;

/// Pool of probe events, shared between the decoder and the processor.
#[derive(Clone, Default)]
pub struct ProbeEventPool {
    free: FreeList,
}

impl ProbeEventPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an event out of the pool, allocating if it is empty. The
    /// returned guard puts it back on drop.
    pub fn acquire(&self) -> PooledEvent {
        let event = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledEvent {
            event: Some(event),
            free: self.free.clone(),
        }
    }

    /// Number of events currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Scoped handle to a pooled [`ProbeEvent`].
///
/// Release happens in `Drop`, so the event goes back to the pool exactly
/// once on every control path, early returns and panics included.
pub struct PooledEvent {
    event: Option<Box<ProbeEvent>>,
    free: FreeList,
}

impl Deref for PooledEvent {
    type Target = ProbeEvent;

    fn deref(&self) -> &ProbeEvent {
        // Some until Drop takes it
        self.event.as_ref().expect("probe event already released")
    }
}

impl DerefMut for PooledEvent {
    fn deref_mut(&mut self) -> &mut ProbeEvent {
        self.event.as_mut().expect("probe event already released")
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        if let Some(mut event) = self.event.take() {
            event.clear();
            self.free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_round_trip() {
        let pool = ProbeEventPool::new();
        assert_eq!(pool.available(), 0);
        let mut event = pool.acquire();
        event.mask = MASK_CREATE;
        event.file_name.push_str("a");
        drop(event);
        assert_eq!(pool.available(), 1);

        // the recycled event comes back blank
        let event = pool.acquire();
        assert_eq!(pool.available(), 0);
        assert_eq!(event.mask, 0);
        assert!(event.file_name.is_empty());
    }

    #[test]
    fn pool_allocates_when_empty() {
        let pool = ProbeEventPool::new();
        let first = pool.acquire();
        let second = pool.acquire();
        drop(first);
        drop(second);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn mask_decoding() {
        assert_eq!(ProbeOp::from_mask(MASK_CREATE), Some(ProbeOp::Create));
        assert_eq!(ProbeOp::from_mask(MASK_DELETE), Some(ProbeOp::Delete));
        // no bit or more than one bit is not a valid record
        assert_eq!(ProbeOp::from_mask(0), None);
        assert_eq!(ProbeOp::from_mask(MASK_CREATE | MASK_DELETE), None);
        assert_eq!(ProbeOp::from_mask(1 << 20), None);
    }

    #[test]
    fn op_mask_round_trip() {
        for op in [
            ProbeOp::Monitor,
            ProbeOp::Create,
            ProbeOp::Modify,
            ProbeOp::Attrib,
            ProbeOp::MoveFrom,
            ProbeOp::MoveTo,
            ProbeOp::Delete,
        ] {
            assert_eq!(ProbeOp::from_mask(op.mask()), Some(op));
        }
    }
}

//! Contract toward the downstream event sink.

use std::{fmt, future::Future};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Errors returned by emitter implementations.
pub type EmitterError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// High-level file change codes, wire-compatible with inotify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOp {
    Create,
    Modify,
    Attrib,
    MovedFrom,
    MovedTo,
    Delete,
}

impl FileOp {
    /// The matching `IN_*` code, for sinks that speak the inotify wire
    /// format.
    pub fn mask(&self) -> u32 {
        match self {
            FileOp::Modify => 0x0000_0002,
            FileOp::Attrib => 0x0000_0004,
            FileOp::MovedFrom => 0x0000_0040,
            FileOp::MovedTo => 0x0000_0080,
            FileOp::Create => 0x0000_0100,
            FileOp::Delete => 0x0000_0200,
        }
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileOp::Create => "IN_CREATE",
            FileOp::Modify => "IN_MODIFY",
            FileOp::Attrib => "IN_ATTRIB",
            FileOp::MovedFrom => "IN_MOVED_FROM",
            FileOp::MovedTo => "IN_MOVED_TO",
            FileOp::Delete => "IN_DELETE",
        })
    }
}

/// Downstream sink for high-level events.
///
/// `emit` is called synchronously from the processor, which blocks the
/// event stream until it returns: implementations must not block and
/// should bound their latency.
pub trait Emitter: Send {
    fn emit(
        &mut self,
        path: &str,
        tid: Pid,
        op: FileOp,
    ) -> impl Future<Output = Result<(), EmitterError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inotify_codes() {
        assert_eq!(FileOp::Create.mask(), 0x100);
        assert_eq!(FileOp::Modify.mask(), 0x2);
        assert_eq!(FileOp::Attrib.mask(), 0x4);
        assert_eq!(FileOp::MovedFrom.mask(), 0x40);
        assert_eq!(FileOp::MovedTo.mask(), 0x80);
        assert_eq!(FileOp::Delete.mask(), 0x200);
    }

    #[test]
    fn display_names() {
        assert_eq!(FileOp::Create.to_string(), "IN_CREATE");
        assert_eq!(FileOp::MovedTo.to_string(), "IN_MOVED_TO");
    }
}

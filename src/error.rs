use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::session::Resume;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: Errno,
    },

    #[error("Could not resume tracee = {pid} with mode = {mode:?}")]
    Resume { pid: Pid, mode: Resume, source: Errno },

    #[error("Tracee = {pid} died mid-operation")]
    TraceeDied { pid: Pid, source: Errno },

    #[error("Could not wait for tracee state changes")]
    Wait { source: Errno },

    #[error("Input/output error")]
    Io(#[from] io::Error),

    #[error("OS error")]
    Os(#[from] Errno),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True iff the root cause of the error is that the tracee already died.
    ///
    /// Deaths discovered this way are recoverable: the kernel will deliver a
    /// proper death notification for the pid on a subsequent wait.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

/// Rewrite `ESRCH` into [`Error::TraceeDied`], preserving other errnos.
pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::Os(source)
            }
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err(crate::error::Error::Internal($msg.into()))
    };
}

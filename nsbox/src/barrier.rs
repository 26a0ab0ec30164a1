//! One-shot start barrier between the launcher and a freshly spawned init.
//!
//! The child inherits the write end of a pipe. It closes that end once its
//! setup is done, or implicitly by exiting. The launcher blocks reading the
//! read end, which returns only after every write end is gone.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd::pipe2;

/// Launcher side of the barrier.
#[derive(Debug)]
pub(crate) struct Barrier(File);

/// Returns the end to hand to the child and the launcher's [`Barrier`].
///
/// Both ends start close-on-exec; only the child's end is made inheritable,
/// so no other process spawned meanwhile keeps the barrier shut.
pub(crate) fn create() -> io::Result<(OwnedFd, Barrier)> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
    fcntl(&tx, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok((tx, Barrier(File::from(rx))))
}

impl Barrier {
    /// Blocks until every write end is closed.
    ///
    /// The caller must have dropped its own copy of the write end first.
    pub(crate) fn wait(mut self) -> io::Result<()> {
        let mut byte = [0u8; 1];
        loop {
            match self.0.read(&mut byte) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

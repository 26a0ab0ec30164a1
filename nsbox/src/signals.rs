//! Deferred signal delivery for the proxy loop.
//!
//! Handlers only record the signal in an atomic bitmask and write one byte
//! to a non-blocking self-pipe. The loop polls the pipe's read end and does
//! the real work (window size sync, protocol send) outside handler context.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use signal_hook::consts::FORBIDDEN;
use signal_hook::{SigId, low_level};
use tracing::debug;

/// Highest forwarded signal number (classic signals only).
const MAX_SIGNAL: i32 = 31;

/// Registered handlers for every catchable signal in `1..=31`.
#[derive(Debug)]
pub(crate) struct Signals {
    /// Bit `n` set means signal `n` arrived since the last [`Signals::take`].
    pending: Arc<AtomicU32>,
    /// Self-pipe read end, non-blocking.
    wake: File,
    /// Self-pipe write end, used from handlers.
    wake_tx: OwnedFd,
    /// Handler registrations, removed on drop.
    ids: Vec<SigId>,
}

impl Signals {
    /// Installs the handlers.
    pub(crate) fn install() -> io::Result<Self> {
        let (rx, tx) = self_pipe()?;
        let pending = Arc::new(AtomicU32::new(0));
        let mut signals = Self {
            pending,
            wake: File::from(rx),
            wake_tx: tx,
            ids: Vec::new(),
        };

        let tx_raw = signals.wake_tx.as_raw_fd();
        for sig in (1..=MAX_SIGNAL).filter(|s| !FORBIDDEN.contains(s)) {
            let pending = Arc::clone(&signals.pending);
            let action = move || {
                pending.fetch_or(1 << sig, Ordering::SeqCst);
                let byte = 1u8;
                // SAFETY: write(2) is async-signal-safe; the pipe outlives
                // the registration. A full pipe already guarantees a wakeup.
                unsafe {
                    libc::write(tx_raw, std::ptr::from_ref(&byte).cast(), 1);
                }
            };
            // SAFETY: the action only touches an atomic and calls write(2).
            let id = unsafe { low_level::register(sig, action) }?;
            signals.ids.push(id);
        }
        debug!(count = signals.ids.len(), "signal handlers installed");
        Ok(signals)
    }

    /// Descriptor that becomes readable when a signal is pending.
    pub(crate) fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }

    /// Drains the wakeup pipe and returns pending signals, lowest first.
    pub(crate) fn take(&mut self) -> io::Result<Vec<i32>> {
        let mut sink = [0u8; 64];
        loop {
            match self.wake.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        let mask = self.pending.swap(0, Ordering::SeqCst);
        Ok((1..=MAX_SIGNAL).filter(|s| mask & (1 << s) != 0).collect())
    }
}

impl Drop for Signals {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            low_level::unregister(id);
        }
    }
}

/// Maps a signal before forwarding it to the remote process.
///
/// Without a pseudo-terminal the daemon delivers signals straight to the
/// shell, which ignores `SIGINT`; `SIGTERM` stops it instead.
pub(crate) const fn translate(sig: i32, interactive: bool) -> i32 {
    if !interactive && sig == libc::SIGINT {
        libc::SIGTERM
    } else {
        sig
    }
}

/// Non-blocking, close-on-exec pipe as `(read, write)`.
fn self_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    // SAFETY: fds is a valid 2-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both FDs are valid after a successful pipe2() call.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    use super::*;

    #[test]
    fn interrupt_becomes_terminate_without_tty() {
        assert_eq!(translate(libc::SIGINT, false), libc::SIGTERM);
        assert_eq!(translate(libc::SIGINT, true), libc::SIGINT);
        assert_eq!(translate(libc::SIGWINCH, false), libc::SIGWINCH);
    }

    #[test]
    fn raised_signals_are_collected_in_order() {
        let mut signals = Signals::install().unwrap();
        // Both are ignored by default, so a stray delivery is harmless.
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGWINCH).unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGURG).unwrap();

        let mut fds = [PollFd::new(signals.wake_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, PollTimeout::from(1000u16)).unwrap(), 1);

        let got = signals.take().unwrap();
        assert!(got.contains(&libc::SIGWINCH));
        assert!(got.contains(&libc::SIGURG));
        assert!(got.windows(2).all(|w| w[0] < w[1]));
        assert!(signals.take().unwrap().is_empty());
    }
}

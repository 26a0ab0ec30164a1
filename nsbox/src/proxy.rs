//! The interactive proxy loop.
//!
//! One thread multiplexes the spawn daemon connection, the signal wakeup
//! pipe and, when a pseudo-terminal is in use, local stdin and the
//! pseudo-terminal master. It returns once the daemon reports the remote
//! exit status.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nsbox_proto::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::signals::{self, Signals};
use crate::terminal::Terminal;

/// Per-read buffer size for terminal data.
const BUF_SIZE: usize = 4096;

/// Runtime state of one proxied session.
#[derive(Debug)]
pub struct ProxySession {
    /// Connection to the spawn daemon, after `Go`.
    sock: UnixStream,
    /// Local terminal bridge; `None` in non-interactive mode.
    terminal: Option<Terminal>,
    /// Pending signal collector.
    signals: Signals,
    /// Where pseudo-terminal output goes.
    output: File,
    /// Whether the master is still part of the poll set.
    master_open: bool,
    /// Rows and columns last applied to the pseudo-terminal.
    last_size: Option<(u16, u16)>,
}

/// What one `poll` call reported.
#[derive(Debug, Clone, Copy, Default)]
struct Ready {
    /// Daemon socket readable or closed.
    sock: bool,
    /// A signal is pending.
    wake: bool,
    /// Local terminal input available.
    input: bool,
    /// Master has output.
    master: bool,
    /// Master hung up or failed.
    master_gone: bool,
}

impl ProxySession {
    /// Builds a session writing terminal output to stdout and installs
    /// signal forwarding.
    pub fn new(sock: UnixStream, terminal: Option<Terminal>) -> Result<Self> {
        let output = io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .map(File::from)
            .map_err(|e| Error::kernel("Cannot duplicate standard stream", e))?;
        Self::with_output(sock, terminal, output)
    }

    /// Like [`ProxySession::new`], with pseudo-terminal output going to
    /// `output`.
    pub fn with_output(sock: UnixStream, terminal: Option<Terminal>, output: File) -> Result<Self> {
        let signals =
            Signals::install().map_err(|e| Error::kernel("Cannot install signal handlers", e))?;
        Ok(Self {
            sock,
            master_open: terminal.is_some(),
            terminal,
            signals,
            output,
            last_size: None,
        })
    }

    /// Whether a pseudo-terminal is in use.
    pub const fn is_interactive(&self) -> bool {
        self.terminal.is_some()
    }

    /// Whether pseudo-terminal output is still being relayed.
    pub const fn master_attached(&self) -> bool {
        self.master_open
    }

    /// Window size most recently forwarded after `SIGWINCH`.
    pub const fn last_window_size(&self) -> Option<(u16, u16)> {
        self.last_size
    }

    /// Runs until the daemon reports an exit status.
    ///
    /// Returns that status, or 1 when the connection closes without a full
    /// status word. The local terminal stays raw until the session drops.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            let ready = match self.wait() {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::kernel("poll", e)),
            };

            if ready.wake {
                self.forward_signals()?;
            }
            if ready.master {
                self.drain_master();
            } else if ready.master_gone {
                debug!("pseudo-terminal hung up");
                self.master_open = false;
            }
            if ready.input {
                self.forward_input()?;
            }
            if ready.sock {
                return Ok(self.finish());
            }
        }
    }

    /// Blocks until the socket, the wakeup pipe, or (with a live
    /// pseudo-terminal) local input or the master become ready.
    fn wait(&self) -> nix::Result<Ready> {
        let mut fds = vec![
            PollFd::new(self.sock.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.signals.wake_fd(), PollFlags::POLLIN),
        ];
        if let (Some(t), true) = (&self.terminal, self.master_open) {
            fds.push(PollFd::new(t.local().as_fd(), PollFlags::POLLIN));
            fds.push(PollFd::new(t.master().as_fd(), PollFlags::POLLIN));
        }
        poll(&mut fds, PollTimeout::NONE)?;

        let has = |i: usize, flags: PollFlags| {
            fds.get(i)
                .and_then(|p| p.revents())
                .is_some_and(|r| r.intersects(flags))
        };
        Ok(Ready {
            sock: has(0, PollFlags::POLLIN | PollFlags::POLLHUP),
            wake: has(1, PollFlags::POLLIN),
            input: has(2, PollFlags::POLLIN),
            master: has(3, PollFlags::POLLIN),
            master_gone: has(3, PollFlags::POLLHUP | PollFlags::POLLERR),
        })
    }

    /// Forwards pending signals to the daemon.
    fn forward_signals(&mut self) -> Result<()> {
        let pending = self
            .signals
            .take()
            .map_err(|e| Error::kernel("signal pipe", e))?;
        for sig in pending {
            if sig == libc::SIGWINCH {
                if let Some(t) = &self.terminal {
                    match t.sync_window_size() {
                        Ok(size) => self.last_size = Some((size.ws_row, size.ws_col)),
                        Err(e) => debug!("window size sync failed: {e}"),
                    }
                }
            }
            let sig = signals::translate(sig, self.is_interactive());
            debug!(sig, "forwarding signal");
            nsbox_proto::send(&mut self.sock, &Command::Signal(sig))
                .map_err(|e| Error::transport("Error sending command to the spawn daemon", e))?;
        }
        Ok(())
    }

    /// Copies everything available on the master to the output.
    fn drain_master(&mut self) {
        let Some(t) = &self.terminal else { return };
        let mut master = t.master();
        let mut buf = [0u8; BUF_SIZE];
        loop {
            match master.read(&mut buf) {
                Ok(0) => {
                    self.master_open = false;
                    return;
                }
                Ok(n) => {
                    if let Err(e) = self.output.write_all(&buf[..n]) {
                        debug!("stdout write failed: {e}");
                    }
                    if n < buf.len() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                // EIO once the last slave descriptor is closed.
                Err(e) => {
                    debug!("pseudo-terminal closed: {e}");
                    self.master_open = false;
                    return;
                }
            }
        }
    }

    /// Copies available local input to the master. Any read failure,
    /// including end of input, is fatal.
    fn forward_input(&self) -> Result<()> {
        let Some(t) = &self.terminal else {
            return Ok(());
        };
        let mut input = t.local();
        let mut avail: libc::c_int = 0;
        // SAFETY: FIONREAD stores one int into a live variable.
        if unsafe { libc::ioctl(input.as_raw_fd(), libc::FIONREAD, &raw mut avail) } < 0 {
            return Err(Error::kernel("ioctl", io::Error::last_os_error()));
        }
        let mut buf = [0u8; BUF_SIZE];
        let want = usize::try_from(avail).unwrap_or(0).min(buf.len());
        let n = match input.read(&mut buf[..want]) {
            Ok(0) => return Err(Error::kernel("read", io::ErrorKind::UnexpectedEof)),
            Ok(n) => n,
            Err(e) => return Err(Error::kernel("read", e)),
        };
        let mut master = t.master();
        if let Err(e) = master.write_all(&buf[..n]) {
            debug!("pseudo-terminal write failed: {e}");
        }
        Ok(())
    }

    /// Reads the exit status once the socket is readable or closed.
    fn finish(&mut self) -> i32 {
        if self.master_open {
            self.drain_master();
        }
        let status = match nsbox_proto::read_exit_status(&mut self.sock) {
            Ok(Some(status)) => status,
            Ok(None) => 1,
            Err(e) => {
                debug!("reading exit status failed: {e}");
                1
            }
        };
        info!(status, "remote process exited");
        status
    }
}

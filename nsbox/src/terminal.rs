//! Pseudo-terminal allocation, raw mode, and window size forwarding.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::OFlag;
use nix::pty::{Winsize, grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{
    InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios, tcgetattr,
    tcsetattr,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Descriptors handed to the spawned process, plus the local terminal if any.
#[derive(Debug)]
pub struct Stdio {
    /// stdin, stdout, stderr for the remote process.
    pub fds: [OwnedFd; 3],
    /// Present when stdin is a terminal and a pseudo-terminal was allocated.
    pub terminal: Option<Terminal>,
}

/// Picks the three descriptors for the remote process from the launcher's
/// own standard streams.
pub fn prepare_stdio() -> Result<Stdio> {
    let (stdin, stdout, stderr) = (io::stdin(), io::stdout(), io::stderr());
    prepare_stdio_from(stdin.as_fd(), stdout.as_fd(), stderr.as_fd())
}

/// Picks the three descriptors for the remote process.
///
/// With a terminal on `stdin`, a pseudo-terminal is allocated and its slave
/// becomes the remote stdin; stdout and stderr use the slave too, but only
/// where the local stream is itself a terminal. Everything else is a
/// duplicate of the given stream.
pub fn prepare_stdio_from(
    stdin: BorrowedFd<'_>,
    stdout: BorrowedFd<'_>,
    stderr: BorrowedFd<'_>,
) -> Result<Stdio> {
    let dup = |fd: BorrowedFd<'_>| {
        fd.try_clone_to_owned()
            .map_err(|e| Error::kernel("Cannot duplicate standard stream", e))
    };

    if !stdin.is_terminal() {
        debug!("stdin is not a terminal, passing streams through");
        return Ok(Stdio {
            fds: [dup(stdin)?, dup(stdout)?, dup(stderr)?],
            terminal: None,
        });
    }

    let (terminal, slave) = Terminal::open(dup(stdin)?)?;
    let pick = |local: BorrowedFd<'_>| {
        if local.is_terminal() { dup(slave.as_fd()) } else { dup(local) }
    };
    let out = pick(stdout)?;
    let err = pick(stderr)?;
    Ok(Stdio {
        fds: [slave, out, err],
        terminal: Some(terminal),
    })
}

/// Local terminal in raw mode, bridged to a pseudo-terminal master.
///
/// Dropping it restores the local terminal's original attributes.
#[derive(Debug)]
pub struct Terminal {
    /// Pseudo-terminal master, non-blocking.
    master: File,
    /// Local terminal, restored on drop.
    local: RawModeGuard,
}

impl Terminal {
    /// Allocates a pseudo-terminal and switches `local` to raw mode.
    ///
    /// `local` is the terminal the user types into; the session reads input
    /// and window sizes from it. Returns the terminal and the slave end.
    pub fn open(local: OwnedFd) -> Result<(Self, OwnedFd)> {
        let saved = tcgetattr(&local)
            .map_err(|e| Error::kernel("Cannot read terminal attributes", e))?;
        let (master, slave) = open_pty(&saved).map_err(|e| Error::kernel("openpty", e))?;

        let size = local_window_size(&local);
        let mut raw = saved.clone();
        make_raw(&mut raw);
        tcsetattr(&local, SetArg::TCSANOW, &raw)
            .map_err(|e| Error::kernel("Cannot switch terminal to raw mode", e))?;
        let local = RawModeGuard {
            fd: File::from(local),
            saved,
        };
        set_window_size(&master, &size)?;
        set_nonblocking(&master).map_err(|e| Error::kernel("fcntl", e))?;

        debug!(rows = size.ws_row, cols = size.ws_col, "pseudo-terminal allocated");
        Ok((Self { master, local }, slave))
    }

    /// Pseudo-terminal master.
    pub const fn master(&self) -> &File {
        &self.master
    }

    /// Local terminal the session reads input from.
    pub const fn local(&self) -> &File {
        &self.local.fd
    }

    /// Copies the local window size to the pseudo-terminal.
    pub fn sync_window_size(&self) -> Result<Winsize> {
        let size = local_window_size(&self.local.fd);
        set_window_size(&self.master, &size)?;
        Ok(size)
    }
}

/// Local terminal with its attributes from before raw mode.
#[derive(Debug)]
struct RawModeGuard {
    /// The local terminal.
    fd: File,
    /// Attributes before raw mode.
    saved: Termios,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved) {
            warn!("failed to restore terminal attributes: {e}");
        }
    }
}

/// Clears line discipline processing for byte-transparent forwarding.
pub(crate) fn make_raw(t: &mut Termios) {
    t.local_flags &= !(LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN | LocalFlags::ECHO);
    t.input_flags &= !(InputFlags::BRKINT
        | InputFlags::ICRNL
        | InputFlags::IGNBRK
        | InputFlags::IGNCR
        | InputFlags::INLCR
        | InputFlags::INPCK
        | InputFlags::ISTRIP
        | InputFlags::IXON
        | InputFlags::PARMRK);
    t.output_flags &= !OutputFlags::OPOST;
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

/// Opens a pseudo-terminal pair and gives the master `attrs`.
///
/// `grantpt` failures are ignored: it may try to chown the slave node and
/// fail with `EPERM` on some systems even though the slave is usable.
fn open_pty(attrs: &Termios) -> io::Result<(File, OwnedFd)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
    if let Err(e) = grantpt(&master) {
        debug!("grantpt: {e}");
    }
    unlockpt(&master)?;
    let name = ptsname_r(&master)?;
    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&name)?;
    if let Err(e) = tcsetattr(&master, SetArg::TCSANOW, attrs) {
        debug!("tcsetattr on pty master: {e}");
    }
    // SAFETY: into_raw_fd transfers sole ownership of a valid descriptor.
    let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
    Ok((master, OwnedFd::from(slave)))
}

/// Reads the window size of a terminal.
fn window_size(fd: &impl AsFd) -> Result<Winsize> {
    let mut ws = EMPTY_SIZE;
    // SAFETY: TIOCGWINSZ writes one winsize into a valid, live struct.
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ, &raw mut ws) };
    if ret == -1 {
        return Err(Error::kernel("TIOCGWINSZ", io::Error::last_os_error()));
    }
    Ok(ws)
}

/// Window size of the local terminal, or all zeroes when it cannot be read.
fn local_window_size(fd: &impl AsFd) -> Winsize {
    window_size(fd).unwrap_or_else(|e| {
        debug!("{e:#}, using an empty window size");
        EMPTY_SIZE
    })
}

/// Size reported when the local terminal has none.
const EMPTY_SIZE: Winsize = Winsize {
    ws_row: 0,
    ws_col: 0,
    ws_xpixel: 0,
    ws_ypixel: 0,
};

/// Applies a window size to a terminal.
fn set_window_size(fd: &impl AsFd, ws: &Winsize) -> Result<()> {
    // SAFETY: TIOCSWINSZ only reads the struct.
    let ret = unsafe {
        libc::ioctl(
            fd.as_fd().as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::from_ref(ws),
        )
    };
    if ret == -1 {
        return Err(Error::kernel("TIOCSWINSZ", io::Error::last_os_error()));
    }
    Ok(())
}

/// Sets `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    // SAFETY: F_GETFL/F_SETFL on a valid descriptor.
    let ret = unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags == -1 {
            -1
        } else {
            libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK)
        }
    };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

//! The proxy loop bridging a local terminal to a pseudo-terminal.
//!
//! A pseudo-terminal pair plays the user's terminal, so nothing touches the
//! terminal the tests run in. Raises `SIGWINCH`, so it lives in its own
//! test binary.

#![cfg(target_os = "linux")]

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::pty::{Winsize, openpty};
use nix::sys::signal::{Signal, kill};
use nix::sys::termios::{LocalFlags, SetArg, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::{Pid, pipe};
use nsbox::{ProxySession, SpawnClient, Terminal};
use nsbox_proto::{Command, HEADER_LEN, Header, decode, recv_with_fds};

fn read_frame(sock: &UnixStream) -> (Command, Vec<OwnedFd>) {
    let mut head = [0u8; HEADER_LEN];
    let (n, fds) = recv_with_fds(sock, &mut head, 3).unwrap();
    assert_eq!(n, HEADER_LEN);
    let header = Header::from_bytes(head).unwrap();
    let mut frame = head.to_vec();
    frame.resize(HEADER_LEN + header.len as usize, 0);
    (&*sock).read_exact(&mut frame[HEADER_LEN..]).unwrap();
    (decode(&mut &frame[..]).unwrap(), fds)
}

const fn size(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn window_size(fd: &impl AsFd) -> (u16, u16) {
    let mut ws = size(0, 0);
    // SAFETY: TIOCGWINSZ writes one winsize into a live struct.
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ, &raw mut ws) };
    assert_eq!(ret, 0);
    (ws.ws_row, ws.ws_col)
}

fn set_window_size(fd: &impl AsFd, ws: &Winsize) {
    // SAFETY: TIOCSWINSZ only reads the struct.
    let ret = unsafe {
        libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCSWINSZ, std::ptr::from_ref(ws))
    };
    assert_eq!(ret, 0);
}

#[test]
fn terminal_session_relays_bytes_resizes_and_restores() {
    let user = openpty(Some(&size(24, 80)), None).unwrap();
    let user_master = File::from(user.master);
    let local = user.slave;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spawnd.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (out_r, out_w) = pipe().unwrap();
    let (ready_tx, ready_rx) = mpsc::channel::<()>();

    let (terminal, slave) = Terminal::open(local.try_clone().unwrap()).unwrap();
    assert!(!tcgetattr(&local).unwrap().local_flags.contains(LocalFlags::ICANON));

    let daemon = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let (go, fds) = read_frame(&sock);
        assert_eq!(go, Command::Go);
        let remote = File::from(fds.into_iter().next().unwrap());
        assert_eq!(window_size(&remote), (24, 80));
        let mut t = tcgetattr(&remote).unwrap();
        cfmakeraw(&mut t);
        tcsetattr(&remote, SetArg::TCSANOW, &t).unwrap();
        ready_rx.recv().unwrap();

        // Remote output reaches the local side.
        (&remote).write_all(b"pong").unwrap();
        let mut out = File::from(out_r);
        let mut got = [0u8; 4];
        out.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");

        // Typed bytes reach the remote side.
        (&user_master).write_all(b"ping").unwrap();
        let mut typed = [0u8; 4];
        (&remote).read_exact(&mut typed).unwrap();
        assert_eq!(&typed, b"ping");

        // A local resize is applied to the pseudo-terminal and forwarded.
        set_window_size(&user_master, &size(50, 132));
        kill(Pid::this(), Signal::SIGWINCH).unwrap();
        let (sig, _) = read_frame(&sock);
        assert_eq!(sig, Command::Signal(libc::SIGWINCH));
        assert_eq!(window_size(&remote), (50, 132));

        // Last slave closes: the master hangs up before the status arrives.
        drop(remote);
        thread::sleep(Duration::from_millis(100));
        sock.write_all(&5i32.to_ne_bytes()).unwrap();
        user_master
    });

    let client = SpawnClient::connect(&path).unwrap();
    let sock = client
        .go([slave.try_clone().unwrap(), slave.try_clone().unwrap(), slave])
        .unwrap();
    let mut session = ProxySession::with_output(sock, Some(terminal), File::from(out_w)).unwrap();
    assert!(session.is_interactive());
    ready_tx.send(()).unwrap();

    assert_eq!(session.run().unwrap(), 5);
    assert_eq!(session.last_window_size(), Some((50, 132)));
    assert!(!session.master_attached());
    let _user_master = daemon.join().unwrap();

    drop(session);
    assert!(tcgetattr(&local).unwrap().local_flags.contains(LocalFlags::ICANON));
}

//! Signal forwarding from the proxy loop.
//!
//! Raises real process signals, so it lives in its own test binary.

#![cfg(target_os = "linux")]

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::mpsc;
use std::thread;

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, pipe};
use nsbox::{ProxySession, SpawnClient};
use nsbox_proto::{Command, HEADER_LEN, Header, decode, recv_with_fds};

fn read_frame(sock: &UnixStream) -> Command {
    let mut head = [0u8; HEADER_LEN];
    let (n, _fds) = recv_with_fds(sock, &mut head, 3).unwrap();
    assert_eq!(n, HEADER_LEN);
    let header = Header::from_bytes(head).unwrap();
    let mut frame = head.to_vec();
    frame.resize(HEADER_LEN + header.len as usize, 0);
    (&*sock).read_exact(&mut frame[HEADER_LEN..]).unwrap();
    decode(&mut &frame[..]).unwrap()
}

#[test]
fn interrupt_is_forwarded_as_terminate_without_a_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spawnd.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (ready_tx, ready_rx) = mpsc::channel::<()>();

    let daemon = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        assert_eq!(read_frame(&sock), Command::Go);

        ready_rx.recv().unwrap();
        kill(Pid::this(), Signal::SIGINT).unwrap();
        let forwarded = read_frame(&sock);

        sock.write_all(&0i32.to_ne_bytes()).unwrap();
        forwarded
    });

    let client = SpawnClient::connect(&path).unwrap();
    let fds: [OwnedFd; 3] = std::array::from_fn(|_| pipe().unwrap().0);
    let sock = client.go(fds).unwrap();

    let mut session = ProxySession::new(sock, None).unwrap();
    assert!(!session.is_interactive());
    ready_tx.send(()).unwrap();
    assert_eq!(session.run().unwrap(), 0);

    assert_eq!(daemon.join().unwrap(), Command::Signal(libc::SIGTERM));
}

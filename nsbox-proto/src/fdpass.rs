//! Descriptor passing over Unix stream sockets (`SCM_RIGHTS`).
//!
//! Sending consumes the descriptors: once `sendmsg` succeeds the kernel has
//! installed duplicates in the peer, and the sender's copies are closed on
//! return so each descriptor has exactly one owner.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::codec::encode;
use crate::message::Command;

/// Sends `bytes` in one message with `fds` attached, then closes `fds`.
pub fn send_with_fds<const N: usize>(
    sock: impl AsFd,
    bytes: &[u8],
    fds: [OwnedFd; N],
) -> io::Result<()> {
    let raw: [RawFd; N] = fds.each_ref().map(AsRawFd::as_raw_fd);
    let data_len = u32::try_from(size_of_val(&raw))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors"))?;

    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(data_len) } as usize;
    // u64 backing storage keeps the control buffer aligned for `cmsghdr`.
    let mut control = vec![0u64; space.div_ceil(size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr().cast_mut().cast(),
        iov_len: bytes.len(),
    };
    // SAFETY: msghdr is plain old data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg_control points at `space` zeroed, aligned bytes, which is
    // enough for one header plus `data_len` bytes of descriptor data.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
        std::ptr::copy_nonoverlapping(
            raw.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            data_len as usize,
        );
    }

    // SAFETY: msg and everything it points to outlive the call.
    let sent = unsafe {
        libc::sendmsg(
            sock.as_fd().as_raw_fd(),
            &raw const msg,
            libc::MSG_NOSIGNAL,
        )
    };
    let sent = usize::try_from(sent).map_err(|_| io::Error::last_os_error())?;
    if sent != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {sent} of {} bytes", bytes.len()),
        ));
    }
    drop(fds);
    Ok(())
}

/// Sends the [`Command::Go`] frame carrying the child's stdin, stdout and stderr.
pub fn send_go(sock: impl AsFd, stdio: [OwnedFd; 3]) -> io::Result<()> {
    send_with_fds(sock, &encode(&Command::Go)?, stdio)
}

/// Receives up to `buf.len()` bytes and any descriptors attached to them.
///
/// Received descriptors are `FD_CLOEXEC`. At most `max_fds` are accepted; a
/// truncated control message is an error (the descriptors that did arrive are
/// still closed).
pub fn recv_with_fds(
    sock: impl AsFd,
    buf: &mut [u8],
    max_fds: usize,
) -> io::Result<(usize, Vec<OwnedFd>)> {
    let data_len = u32::try_from(max_fds * size_of::<RawFd>())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors"))?;
    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(data_len) } as usize;
    let mut control = vec![0u64; space.div_ceil(size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: as in `send_with_fds`.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg points at live buffers of the advertised sizes.
    let n = unsafe {
        libc::recvmsg(
            sock.as_fd().as_raw_fd(),
            &raw mut msg,
            libc::MSG_CMSG_CLOEXEC,
        )
    };
    let n = usize::try_from(n).map_err(|_| io::Error::last_os_error())?;

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control; CMSG_* walk it within
    // msg_controllen and each SCM_RIGHTS payload is a packed RawFd array.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg);
                for i in 0..payload / size_of::<RawFd>() {
                    let fd = data
                        .add(i * size_of::<RawFd>())
                        .cast::<RawFd>()
                        .read_unaligned();
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor control message truncated",
        ));
    }
    Ok((n, fds))
}
